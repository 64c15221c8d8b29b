// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Downstream delivery of new anomalies (alerting, dashboards).

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use super::Anomaly;
use crate::storage::traits::StorageError;

/// Receives each anomaly once, when it is first recorded.
///
/// Failures are logged by the detector and never fail a sweep.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, anomaly: &Anomaly) -> Result<(), StorageError>;
}

/// Writes anomalies to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, anomaly: &Anomaly) -> Result<(), StorageError> {
        warn!(
            anomaly_id = %anomaly.id,
            node_id = %anomaly.node_id,
            metric = %anomaly.metric,
            severity = anomaly.severity.as_str(),
            classification = anomaly.classification.as_str(),
            observed_at = %anomaly.observed_at,
            "Anomaly"
        );
        Ok(())
    }
}

/// Forwards anomalies into a bounded channel.
///
/// A full channel drops the notification rather than stalling the sweep.
pub struct ChannelSink {
    tx: mpsc::Sender<Anomaly>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Anomaly>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, anomaly: &Anomaly) -> Result<(), StorageError> {
        self.tx.try_send(anomaly.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => StorageError::Unavailable("notification channel full".into()),
            mpsc::error::TrySendError::Closed(_) => StorageError::Unavailable("notification channel closed".into()),
        })
    }
}
