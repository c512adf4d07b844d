//! Node health and cluster readiness aggregation

use serde::{Deserialize, Serialize};
use uponline_core::config::{GpuThresholds, HealthConfig};
use uponline_core::{NodeHealth, Readiness};

/// Latest signals reported for one GPU node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSignals {
    pub gpu_temperature_c: Option<f64>,
    pub utilization_pct: Option<f64>,
    pub memory_pct: Option<f64>,
    pub nvlink_pct: Option<f64>,
    pub xid_errors: Option<f64>,
    pub driver_version: Option<String>,
}

impl NodeSignals {
    /// Whether any telemetry has been accepted for this node
    pub fn is_reporting(&self) -> bool {
        self.gpu_temperature_c.is_some()
            || self.utilization_pct.is_some()
            || self.memory_pct.is_some()
            || self.nvlink_pct.is_some()
            || self.xid_errors.is_some()
    }
}

/// Derived health of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAssessment {
    pub health: NodeHealth,
    pub thermal_anomaly: bool,
}

impl NodeAssessment {
    /// A throttled node slows down every job with GPUs on it
    pub fn is_throttled(&self) -> bool {
        self.thermal_anomaly || self.health != NodeHealth::Healthy
    }
}

impl Default for NodeAssessment {
    fn default() -> Self {
        Self {
            health: NodeHealth::Healthy,
            thermal_anomaly: false,
        }
    }
}

/// Classify a node from its signals against its GPU model's thresholds
pub fn assess_node(
    signals: &NodeSignals,
    thresholds: &GpuThresholds,
    config: &HealthConfig,
) -> NodeAssessment {
    let temp = signals.gpu_temperature_c;
    let thermal_anomaly = temp.map(|t| t > thresholds.anomaly_temp_c).unwrap_or(false);
    let thermal_critical = temp.map(|t| t >= thresholds.critical_temp_c).unwrap_or(false);
    let nvlink_degraded = signals
        .nvlink_pct
        .map(|pct| pct < config.nvlink_warn_pct)
        .unwrap_or(false);
    let xid = signals.xid_errors.map(|n| n > 0.0).unwrap_or(false);

    let health = if thermal_critical {
        NodeHealth::Critical
    } else if thermal_anomaly || nvlink_degraded || xid {
        NodeHealth::Warning
    } else {
        NodeHealth::Healthy
    };

    NodeAssessment {
        health,
        thermal_anomaly,
    }
}

/// Per-node input to cluster aggregation
#[derive(Debug, Clone)]
pub struct NodeSummary<'a> {
    pub assessment: NodeAssessment,
    pub signals: &'a NodeSignals,
}

/// Roll-up of node signals into cluster readiness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub readiness: Readiness,
    pub node_count: usize,
    pub reporting_nodes: usize,
    pub healthy_nodes: usize,
    pub warning_nodes: usize,
    pub critical_nodes: usize,
    pub thermal_anomalies: usize,
    pub driver_drift: usize,
    /// Average over nodes that report NVLink health; `None` if none do
    pub nvlink_health_pct: Option<f64>,
    pub avg_gpu_temperature_c: Option<f64>,
    pub avg_utilization_pct: Option<f64>,
}

pub fn aggregate_cluster(nodes: &[NodeSummary<'_>], expected_driver: Option<&str>) -> ClusterHealth {
    let count = |health: NodeHealth| nodes.iter().filter(|n| n.assessment.health == health).count();
    let critical_nodes = count(NodeHealth::Critical);
    let warning_nodes = count(NodeHealth::Warning);

    let driver_drift = match expected_driver {
        Some(expected) => nodes
            .iter()
            .filter(|n| {
                n.signals
                    .driver_version
                    .as_deref()
                    .map(|v| v != expected)
                    .unwrap_or(false)
            })
            .count(),
        None => 0,
    };

    let readiness = if critical_nodes > 0 {
        Readiness::NotReady
    } else if warning_nodes > 0 || driver_drift > 0 {
        Readiness::Degraded
    } else {
        Readiness::Ready
    };

    ClusterHealth {
        readiness,
        node_count: nodes.len(),
        reporting_nodes: nodes.iter().filter(|n| n.signals.is_reporting()).count(),
        healthy_nodes: nodes.len() - critical_nodes - warning_nodes,
        warning_nodes,
        critical_nodes,
        thermal_anomalies: nodes.iter().filter(|n| n.assessment.thermal_anomaly).count(),
        driver_drift,
        nvlink_health_pct: average(nodes.iter().filter_map(|n| n.signals.nvlink_pct)),
        avg_gpu_temperature_c: average(nodes.iter().filter_map(|n| n.signals.gpu_temperature_c)),
        avg_utilization_pct: average(nodes.iter().filter_map(|n| n.signals.utilization_pct)),
    }
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Severity score of a node's GPU temperature: 50 at the anomaly threshold
/// rising to 100 at the critical threshold
pub fn node_thermal_score(temp_c: f64, thresholds: &GpuThresholds) -> u8 {
    let span = thresholds.critical_temp_c - thresholds.anomaly_temp_c;
    let fraction = if span > 0.0 {
        (temp_c - thresholds.anomaly_temp_c) / span
    } else {
        1.0
    };
    (50.0 + 50.0 * fraction.clamp(0.0, 1.0)).round() as u8
}
