//! Immutable, versioned views of the computed engine state
//!
//! A snapshot is built in one pass while ingestion writers are held off, so
//! every field in it belongs to the same point in time. Readers share it
//! through `Arc` and never see it change.

use crate::health::ClusterHealth;
use crate::propagation::RiskTrace;
use crate::scoring::ScoreBreakdown;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uponline_core::topology::Topology;
use uponline_core::{
    ClusterId, CrahId, JobId, JobStatus, NodeHealth, NodeId, PowerDomainId, PowerDomainKind,
    RackId, Readiness, RiskLevel, RiskSeverity, Trend, UnitStatus, ZoneId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RackView {
    pub id: RackId,
    pub row: String,
    pub position: u32,
    pub gpu_count: u32,
    pub cooling_zone: ZoneId,
    pub pdu: PowerDomainId,
    pub pdu_capacity_kw: f64,
    pub retired: bool,
    pub inlet_c: Option<f64>,
    pub power_kw: Option<f64>,
    pub thermal_margin_pct: Option<f64>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub previous_score: Option<u8>,
    pub trend: Trend,
    pub breakdown: Option<ScoreBreakdown>,
    /// Score is frozen because telemetry stopped arriving
    pub stale: bool,
    pub last_sample: Option<DateTime<Utc>>,
}

impl RackView {
    pub fn power_headroom_kw(&self) -> Option<f64> {
        self.power_kw.map(|kw| self.pdu_capacity_kw - kw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrahView {
    pub name: CrahId,
    pub status: UnitStatus,
    pub rated_capacity_kw: f64,
    pub effective_capacity_kw: f64,
    pub setpoint_c: f64,
    pub supply_temperature_c: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneView {
    pub name: ZoneId,
    pub racks: Vec<RackId>,
    pub crah_units: Vec<CrahView>,
    pub effective_capacity_kw: f64,
    pub heat_load_kw: f64,
    /// `None` when the zone has no effective cooling capacity
    pub margin_pct: Option<f64>,
    /// Unit with the lowest effective share of its rating
    pub worst_unit: Option<CrahId>,
    /// Largest single unit's effective capacity, lost in an N+1 event
    pub largest_unit_kw: f64,
    /// Highest risk score among the zone's racks
    pub max_rack_score: u8,
    pub risk_score: u8,
}

impl ZoneView {
    pub fn used_fraction(&self) -> f64 {
        if self.effective_capacity_kw <= 0.0 {
            1.0
        } else {
            self.heat_load_kw / self.effective_capacity_kw
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerUnitView {
    pub name: String,
    pub status: UnitStatus,
    pub capacity_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerDomainView {
    pub id: PowerDomainId,
    pub kind: PowerDomainKind,
    pub parent: Option<PowerDomainId>,
    pub rated_capacity_kw: f64,
    /// Sum of descendant rack draw
    pub load_kw: f64,
    pub headroom_kw: f64,
    pub headroom_pct: f64,
    pub redundant_units: Vec<PowerUnitView>,
    pub max_rack_score: u8,
}

impl PowerDomainView {
    /// Capacity left after losing the largest online unit, if the domain
    /// models at least two redundant units
    pub fn n_plus_one_capacity_kw(&self) -> Option<f64> {
        if self.redundant_units.len() < 2 {
            return None;
        }
        let online: Vec<f64> = self
            .redundant_units
            .iter()
            .filter(|u| u.status != UnitStatus::Offline)
            .map(|u| u.capacity_kw)
            .collect();
        let total: f64 = online.iter().sum();
        let largest = online.iter().copied().fold(0.0, f64::max);
        Some(total - largest)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub hostname: NodeId,
    pub cluster: ClusterId,
    pub rack: RackId,
    pub gpus: u32,
    pub gpu_temperature_c: Option<f64>,
    pub utilization_pct: Option<f64>,
    pub memory_pct: Option<f64>,
    pub nvlink_pct: Option<f64>,
    pub xid_errors: Option<f64>,
    pub driver_version: Option<String>,
    pub health: NodeHealth,
    pub thermal_anomaly: bool,
    pub throttled: bool,
    /// Thermal severity, 0 unless the node is above its anomaly threshold
    pub risk_score: u8,
    pub last_sample: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    pub name: ClusterId,
    pub gpu_model: String,
    pub expected_driver_version: Option<String>,
    pub gpu_count: u32,
    pub racks: Vec<RackId>,
    /// Worst risk score among the cluster's active racks
    pub max_rack_score: u8,
    pub risk_level: RiskLevel,
    pub health: ClusterHealth,
}

impl ClusterView {
    pub fn readiness(&self) -> Readiness {
        self.health.readiness
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub name: JobId,
    pub cluster: ClusterId,
    pub base_status: JobStatus,
    pub status: JobStatus,
    pub assigned_gpus: u32,
    pub racks: Vec<RackId>,
    pub infra_risk: RiskLevel,
    pub slowdown_pct: f64,
    pub trace: Option<RiskTrace>,
    pub expected_end: Option<DateTime<Utc>>,
    /// Bumped on every write to the job's derived fields
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskKind {
    ThermalExceedance,
    ThermalMarginLow,
    PowerHeadroomLow,
    LoadVolatility,
    CoolingMarginNarrowing,
    GpuThermalThrottling,
    StaleTelemetry,
}

impl std::fmt::Display for RiskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskKind::ThermalExceedance => "Thermal Exceedance",
            RiskKind::ThermalMarginLow => "Thermal Margin Low",
            RiskKind::PowerHeadroomLow => "Power Headroom Low",
            RiskKind::LoadVolatility => "Load Volatility",
            RiskKind::CoolingMarginNarrowing => "Cooling Margin Narrowing",
            RiskKind::GpuThermalThrottling => "GPU Thermal Throttling",
            RiskKind::StaleTelemetry => "Stale Telemetry",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRisk {
    pub id: String,
    pub severity: RiskSeverity,
    pub kind: RiskKind,
    pub location: String,
    pub risk_score: u8,
    pub trend: Trend,
    pub detail: String,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub average_rack_risk: f64,
    /// Headroom across the roots of the power tree
    pub facility_power_headroom_pct: Option<f64>,
    /// Healthy nodes as a share of nodes reporting telemetry
    pub gpu_fleet_health_pct: Option<f64>,
    pub at_risk_jobs: usize,
    pub stale_racks: usize,
    pub critical_risks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub topology_version: u64,
    pub created_at: DateTime<Utc>,
    pub racks: BTreeMap<RackId, RackView>,
    pub zones: BTreeMap<ZoneId, ZoneView>,
    pub power_domains: BTreeMap<PowerDomainId, PowerDomainView>,
    pub nodes: BTreeMap<NodeId, NodeView>,
    pub clusters: BTreeMap<ClusterId, ClusterView>,
    pub jobs: BTreeMap<JobId, JobView>,
    /// Sorted by score descending, then id
    pub active_risks: Vec<ActiveRisk>,
    pub summary: FleetSummary,
    #[serde(skip)]
    pub topology: Arc<Topology>,
}

impl Snapshot {
    pub fn rack(&self, id: &RackId) -> Option<&RackView> {
        self.racks.get(id)
    }

    pub fn zone(&self, name: &ZoneId) -> Option<&ZoneView> {
        self.zones.get(name)
    }

    pub fn power_domain(&self, id: &PowerDomainId) -> Option<&PowerDomainView> {
        self.power_domains.get(id)
    }

    pub fn node(&self, hostname: &NodeId) -> Option<&NodeView> {
        self.nodes.get(hostname)
    }

    pub fn cluster(&self, name: &ClusterId) -> Option<&ClusterView> {
        self.clusters.get(name)
    }

    pub fn job(&self, name: &JobId) -> Option<&JobView> {
        self.jobs.get(name)
    }

    /// Risks at or above `min`, highest score first
    pub fn risks_at_least(&self, min: RiskSeverity) -> Vec<&ActiveRisk> {
        self.active_risks.iter().filter(|r| r.severity >= min).collect()
    }

    /// Jobs with GPUs on the rack
    pub fn jobs_on_rack(&self, rack: &RackId) -> Vec<&JobView> {
        self.jobs.values().filter(|j| j.racks.contains(rack)).collect()
    }
}
