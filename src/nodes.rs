// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Monitoring node registry.
//!
//! Nodes are registered on first ingestion and updated by ingestion and the
//! data quality job. They are never removed; `deactivate` is the terminal
//! state and survives later readings.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::quality::{QualityViolation, ViolationKind};
use crate::reading::{MetricKind, SensorReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    /// Recent data failed quality screening
    Degraded,
    /// No reading within the offline window
    Offline,
    /// Deactivated by an operator
    Inactive,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
            Self::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringNode {
    pub id: String,
    pub location: Option<String>,
    pub status: NodeStatus,
    pub sensor_types: Vec<MetricKind>,
    pub last_reading_ts: Option<DateTime<Utc>>,
    #[serde(skip)]
    last_total_flow: Option<f64>,
}

impl MonitoringNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: None,
            status: NodeStatus::Active,
            sensor_types: MetricKind::ALL.to_vec(),
            last_reading_ts: None,
            last_total_flow: None,
        }
    }

    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    #[must_use]
    pub fn with_sensors(mut self, sensors: Vec<MetricKind>) -> Self {
        self.sensor_types = sensors;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status != NodeStatus::Inactive
    }
}

/// What ingestion learned from one reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// The reading is the most recent seen for its node
    pub newest: bool,
    pub violation: Option<QualityViolation>,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, MonitoringNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update node metadata. Status and reading history are kept.
    pub fn register(&self, node: MonitoringNode) {
        match self.nodes.get_mut(&node.id) {
            Some(mut existing) => {
                existing.location = node.location;
                existing.sensor_types = node.sensor_types;
            }
            None => {
                info!(node_id = %node.id, "Registered monitoring node");
                self.nodes.insert(node.id.clone(), node);
            }
        }
    }

    /// Track an ingested reading.
    ///
    /// Reports a violation when the totalizer decreased without a reset
    /// marker. Marked resets are logged. Out-of-order readings only
    /// register the node.
    pub fn observe(&self, reading: &SensorReading) -> Observation {
        let mut node = self
            .nodes
            .entry(reading.node_id.clone())
            .or_insert_with(|| MonitoringNode::new(reading.node_id.clone()));

        if node.last_reading_ts.is_some_and(|last| reading.timestamp < last) {
            return Observation::default();
        }

        let mut violation = None;
        if let Some(prev) = node.last_total_flow {
            if reading.counter_reset {
                info!(
                    node_id = %reading.node_id,
                    previous = prev,
                    current = reading.total_flow,
                    ts = %reading.timestamp,
                    "Totalizer counter reset"
                );
            } else if reading.total_flow < prev {
                violation = Some(QualityViolation {
                    node_id: reading.node_id.clone(),
                    timestamp: reading.timestamp,
                    kind: ViolationKind::CounterDecrease {
                        previous: prev,
                        current: reading.total_flow,
                    },
                });
            }
        }

        node.last_reading_ts = Some(reading.timestamp);
        if violation.is_none() {
            node.last_total_flow = Some(reading.total_flow);
        }
        if node.status == NodeStatus::Offline {
            node.status = NodeStatus::Active;
        }
        Observation { newest: true, violation }
    }

    pub fn get(&self, node_id: &str) -> Option<MonitoringNode> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    /// All nodes, sorted by id.
    pub fn list(&self) -> Vec<MonitoringNode> {
        let mut nodes: Vec<MonitoringNode> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Ids of nodes not deactivated, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.is_active())
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Permanently deactivate a node.
    pub fn deactivate(&self, node_id: &str) -> Result<(), EngineError> {
        let mut node = self.nodes.get_mut(node_id).ok_or_else(|| EngineError::NotFound {
            what: "node",
            id: node_id.to_string(),
        })?;
        if node.status != NodeStatus::Inactive {
            warn!(node_id = %node_id, "Deactivating monitoring node");
            node.status = NodeStatus::Inactive;
        }
        Ok(())
    }

    /// Health-driven status change. Inactive nodes are left alone.
    pub fn set_status(&self, node_id: &str, status: NodeStatus) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(mut node) if node.status != NodeStatus::Inactive && status != NodeStatus::Inactive => {
                if node.status != status {
                    info!(node_id = %node_id, from = %node.status, to = %status, "Node status changed");
                    node.status = status;
                }
                true
            }
            _ => false,
        }
    }
}
