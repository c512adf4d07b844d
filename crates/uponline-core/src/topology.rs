//! Physical and logical topology of the data center floor
//!
//! The topology is load-time input and authoritative: racks, cooling zones,
//! the power delivery tree, GPU clusters and nodes, and the training jobs
//! placed on them. The engine rebuilds its dependency graph whenever a new
//! topology is loaded.

use crate::types::{
    ClusterId, CrahId, JobId, JobStatus, NodeId, PowerDomainId, PowerDomainKind, RackId,
    UnitStatus, ZoneId,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Complete topology document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub racks: Vec<RackSpec>,
    pub cooling_zones: Vec<CoolingZoneSpec>,
    pub power_domains: Vec<PowerDomainSpec>,
    pub clusters: Vec<ClusterSpec>,
    pub nodes: Vec<NodeSpec>,
    pub jobs: Vec<JobSpec>,
}

/// A rack position on the floor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RackSpec {
    pub id: RackId,
    pub row: String,
    pub position: u32,
    #[serde(default)]
    pub gpu_count: u32,
    pub cooling_zone: ZoneId,
    pub pdu: PowerDomainId,
    /// Decommissioned racks stay in the topology
    #[serde(default)]
    pub retired: bool,
}

/// A cooling zone served by one or more CRAH units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoolingZoneSpec {
    pub name: ZoneId,
    pub crah_units: Vec<CrahUnitSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrahUnitSpec {
    pub name: CrahId,
    pub rated_capacity_kw: f64,
    pub setpoint_c: f64,
    #[serde(default)]
    pub status: UnitStatus,
}

/// A node of the power delivery tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerDomainSpec {
    pub id: PowerDomainId,
    pub kind: PowerDomainKind,
    #[serde(default)]
    pub parent: Option<PowerDomainId>,
    pub rated_capacity_kw: f64,
    #[serde(default)]
    pub status: UnitStatus,
    /// Parallel modules sharing this domain's load (N+1 group)
    #[serde(default)]
    pub redundant_units: Vec<PowerUnitSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerUnitSpec {
    pub name: String,
    pub capacity_kw: f64,
    #[serde(default)]
    pub status: UnitStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: ClusterId,
    pub gpu_model: String,
    /// Driver version every node is expected to run
    #[serde(default)]
    pub driver_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub hostname: NodeId,
    pub cluster: ClusterId,
    pub rack: RackId,
    #[serde(default = "default_node_gpus")]
    pub gpus: u32,
}

fn default_node_gpus() -> u32 {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: JobId,
    pub cluster: ClusterId,
    pub status: JobStatus,
    #[serde(default)]
    pub assignments: Vec<GpuAssignment>,
    #[serde(default)]
    pub expected_end: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn assigned_gpus(&self) -> u32 {
        self.assignments.iter().map(|a| a.gpus).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuAssignment {
    pub node: NodeId,
    pub gpus: u32,
}

/// One row of the rack mapping CSV
#[derive(Debug, Deserialize)]
struct RackCsvRow {
    rack_id: String,
    row: String,
    position: u32,
    pdu: String,
    cooling_zone: String,
    gpu_count: u32,
}

impl Topology {
    /// Parse a YAML topology document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parse a JSON topology document
    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load and validate a topology file; `.json` is parsed as JSON, anything
    /// else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let topology = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };
        topology.validate()?;
        tracing::debug!(
            path = %path.display(),
            racks = topology.racks.len(),
            nodes = topology.nodes.len(),
            jobs = topology.jobs.len(),
            "Loaded topology"
        );
        Ok(topology)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Merge a rack mapping CSV (`rack_id,row,position,pdu,cooling_zone,gpu_count`)
    /// into this topology, replacing racks with the same id. Returns the number
    /// of rows merged. The result is not validated; call [`Topology::validate`].
    pub fn merge_rack_csv(&mut self, content: &str) -> Result<usize> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let mut merged = 0;
        for row in reader.deserialize() {
            let row: RackCsvRow = row?;
            let spec = RackSpec {
                id: RackId::new(row.rack_id),
                row: row.row,
                position: row.position,
                gpu_count: row.gpu_count,
                cooling_zone: ZoneId::new(row.cooling_zone),
                pdu: PowerDomainId::new(row.pdu),
                retired: false,
            };

            match self.racks.iter_mut().find(|r| r.id == spec.id) {
                Some(existing) => {
                    let retired = existing.retired;
                    *existing = RackSpec { retired, ..spec };
                }
                None => self.racks.push(spec),
            }
            merged += 1;
        }

        Ok(merged)
    }

    /// Validate referential integrity and the power tree shape
    pub fn validate(&self) -> Result<()> {
        let zones = unique_ids(self.cooling_zones.iter().map(|z| &z.name), "cooling zone")?;
        let domains = unique_ids(self.power_domains.iter().map(|d| &d.id), "power domain")?;
        let racks = unique_ids(self.racks.iter().map(|r| &r.id), "rack")?;
        let clusters = unique_ids(self.clusters.iter().map(|c| &c.name), "cluster")?;
        let nodes = unique_ids(self.nodes.iter().map(|n| &n.hostname), "node")?;
        unique_ids(self.jobs.iter().map(|j| &j.name), "job")?;

        for zone in &self.cooling_zones {
            unique_ids(zone.crah_units.iter().map(|u| &u.name), "CRAH unit")?;
            if zone.crah_units.iter().any(|u| !non_negative(u.rated_capacity_kw)) {
                return Err(Error::topology(format!(
                    "cooling zone {} has a negative or non-finite CRAH capacity",
                    zone.name
                )));
            }
        }

        for domain in &self.power_domains {
            if !(domain.rated_capacity_kw.is_finite() && domain.rated_capacity_kw > 0.0) {
                return Err(Error::topology(format!(
                    "power domain {} must have a positive rated capacity",
                    domain.id
                )));
            }
            if domain.redundant_units.iter().any(|u| !non_negative(u.capacity_kw)) {
                return Err(Error::topology(format!(
                    "power domain {} has a negative or non-finite unit capacity",
                    domain.id
                )));
            }
            if let Some(parent) = &domain.parent {
                if !domains.contains(parent) {
                    return Err(Error::topology(format!(
                        "power domain {} references unknown parent {}",
                        domain.id, parent
                    )));
                }
            }
        }
        self.check_power_tree_acyclic()?;

        for rack in &self.racks {
            if !zones.contains(&rack.cooling_zone) {
                return Err(Error::topology(format!(
                    "rack {} references unknown cooling zone {}",
                    rack.id, rack.cooling_zone
                )));
            }
            match self.power_domain(&rack.pdu) {
                Some(pdu) if pdu.kind == PowerDomainKind::Pdu => {}
                Some(other) => {
                    return Err(Error::topology(format!(
                        "rack {} is fed by {} which is a {}, not a pdu",
                        rack.id, other.id, other.kind
                    )))
                }
                None => {
                    return Err(Error::topology(format!(
                        "rack {} references unknown pdu {}",
                        rack.id, rack.pdu
                    )))
                }
            }
        }

        for node in &self.nodes {
            if !racks.contains(&node.rack) {
                return Err(Error::topology(format!(
                    "node {} references unknown rack {}",
                    node.hostname, node.rack
                )));
            }
            if !clusters.contains(&node.cluster) {
                return Err(Error::topology(format!(
                    "node {} references unknown cluster {}",
                    node.hostname, node.cluster
                )));
            }
        }

        for job in &self.jobs {
            if job.status == JobStatus::AtRisk {
                return Err(Error::topology(format!(
                    "job {} declares status At Risk, which is derived",
                    job.name
                )));
            }
            if !clusters.contains(&job.cluster) {
                return Err(Error::topology(format!(
                    "job {} references unknown cluster {}",
                    job.name, job.cluster
                )));
            }
            for assignment in &job.assignments {
                if !nodes.contains(&assignment.node) {
                    return Err(Error::topology(format!(
                        "job {} is assigned to unknown node {}",
                        job.name, assignment.node
                    )));
                }
                let node = self.node(&assignment.node);
                if node.map(|n| &n.cluster) != Some(&job.cluster) {
                    return Err(Error::topology(format!(
                        "job {} is assigned to node {} outside cluster {}",
                        job.name, assignment.node, job.cluster
                    )));
                }
                if node.map(|n| assignment.gpus > n.gpus).unwrap_or(false) {
                    return Err(Error::topology(format!(
                        "job {} requests {} GPUs on node {} which has fewer",
                        job.name, assignment.gpus, assignment.node
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_power_tree_acyclic(&self) -> Result<()> {
        let parents: HashMap<&PowerDomainId, Option<&PowerDomainId>> = self
            .power_domains
            .iter()
            .map(|d| (&d.id, d.parent.as_ref()))
            .collect();

        for domain in &self.power_domains {
            let mut seen = HashSet::new();
            let mut current = Some(&domain.id);
            while let Some(id) = current {
                if !seen.insert(id) {
                    return Err(Error::topology(format!(
                        "power tree has a cycle through {}",
                        id
                    )));
                }
                current = parents.get(id).copied().flatten();
            }
        }
        Ok(())
    }

    pub fn rack(&self, id: &RackId) -> Option<&RackSpec> {
        self.racks.iter().find(|r| &r.id == id)
    }

    pub fn cooling_zone(&self, name: &ZoneId) -> Option<&CoolingZoneSpec> {
        self.cooling_zones.iter().find(|z| &z.name == name)
    }

    pub fn power_domain(&self, id: &PowerDomainId) -> Option<&PowerDomainSpec> {
        self.power_domains.iter().find(|d| &d.id == id)
    }

    pub fn cluster(&self, name: &ClusterId) -> Option<&ClusterSpec> {
        self.clusters.iter().find(|c| &c.name == name)
    }

    pub fn node(&self, hostname: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| &n.hostname == hostname)
    }

    pub fn job(&self, name: &JobId) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| &j.name == name)
    }

    /// Chain of power domains from `id` up to the root, starting with `id`
    pub fn power_path(&self, id: &PowerDomainId) -> Vec<&PowerDomainSpec> {
        let mut path = Vec::new();
        let mut current = self.power_domain(id);
        while let Some(domain) = current {
            if path.len() > self.power_domains.len() {
                break;
            }
            path.push(domain);
            current = domain.parent.as_ref().and_then(|p| self.power_domain(p));
        }
        path
    }

    /// Whether `domain` is `ancestor` or lies below it in the power tree
    pub fn is_under(&self, domain: &PowerDomainId, ancestor: &PowerDomainId) -> bool {
        self.power_path(domain).iter().any(|d| &d.id == ancestor)
    }

    /// Racks fed from `domain` or any domain below it
    pub fn racks_under(&self, domain: &PowerDomainId) -> Vec<&RackSpec> {
        self.racks
            .iter()
            .filter(|r| self.is_under(&r.pdu, domain))
            .collect()
    }

    pub fn racks_in_zone(&self, zone: &ZoneId) -> Vec<&RackSpec> {
        self.racks.iter().filter(|r| &r.cooling_zone == zone).collect()
    }

    /// Distinct racks hosting a cluster's nodes, in topology order
    pub fn cluster_racks(&self, cluster: &ClusterId) -> Vec<&RackSpec> {
        let hosting: HashSet<&RackId> = self
            .nodes
            .iter()
            .filter(|n| &n.cluster == cluster)
            .map(|n| &n.rack)
            .collect();
        self.racks.iter().filter(|r| hosting.contains(&r.id)).collect()
    }

    pub fn nodes_in_rack(&self, rack: &RackId) -> Vec<&NodeSpec> {
        self.nodes.iter().filter(|n| &n.rack == rack).collect()
    }
}

fn non_negative(kw: f64) -> bool {
    kw.is_finite() && kw >= 0.0
}

fn unique_ids<'a, T>(ids: impl Iterator<Item = &'a T>, what: &str) -> Result<HashSet<&'a T>>
where
    T: std::hash::Hash + Eq + std::fmt::Display + 'a,
{
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(Error::topology(format!("duplicate {} id {}", what, id)));
        }
    }
    Ok(seen)
}
