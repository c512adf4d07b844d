//! Risk propagation from racks to training jobs
//!
//! The dependency graph is a static edge set `Job -> Node -> Rack` resolved
//! to arena indices when a topology is loaded, plus the reverse edges used to
//! find the jobs affected by a rack or node update. It is rebuilt only when
//! the topology changes.

use crate::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uponline_core::config::PropagationConfig;
use uponline_core::topology::Topology;
use uponline_core::{JobStatus, RackId, RiskLevel, ZoneId};

/// GPUs of one job on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub node: usize,
    pub rack: usize,
    pub gpus: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    topology_version: u64,
    job_placements: Vec<Vec<Placement>>,
    rack_jobs: Vec<Vec<usize>>,
    node_jobs: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn build(topology: &Topology, topology_version: u64) -> Result<Self> {
        let rack_index: HashMap<&RackId, usize> = topology
            .racks
            .iter()
            .enumerate()
            .map(|(i, r)| (&r.id, i))
            .collect();
        let node_index: HashMap<_, _> = topology
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (&n.hostname, i))
            .collect();

        let mut job_placements = Vec::with_capacity(topology.jobs.len());
        let mut rack_jobs = vec![Vec::new(); topology.racks.len()];
        let mut node_jobs = vec![Vec::new(); topology.nodes.len()];

        for (job_idx, job) in topology.jobs.iter().enumerate() {
            let mut placements = Vec::with_capacity(job.assignments.len());
            for assignment in job.assignments.iter().filter(|a| a.gpus > 0) {
                let node = *node_index.get(&assignment.node).ok_or_else(|| {
                    StateError::Graph(format!(
                        "job {} references unknown node {}",
                        job.name, assignment.node
                    ))
                })?;
                let rack_id = &topology.nodes[node].rack;
                let rack = *rack_index.get(rack_id).ok_or_else(|| {
                    StateError::Graph(format!(
                        "node {} references unknown rack {}",
                        assignment.node, rack_id
                    ))
                })?;

                placements.push(Placement {
                    node,
                    rack,
                    gpus: assignment.gpus,
                });
                if !rack_jobs[rack].contains(&job_idx) {
                    rack_jobs[rack].push(job_idx);
                }
                if !node_jobs[node].contains(&job_idx) {
                    node_jobs[node].push(job_idx);
                }
            }
            job_placements.push(placements);
        }

        Ok(Self {
            topology_version,
            job_placements,
            rack_jobs,
            node_jobs,
        })
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    pub fn job_count(&self) -> usize {
        self.job_placements.len()
    }

    pub fn placements(&self, job: usize) -> &[Placement] {
        self.job_placements.get(job).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Jobs with GPUs in the rack (reverse edge walk)
    pub fn jobs_for_rack(&self, rack: usize) -> &[usize] {
        self.rack_jobs.get(rack).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn jobs_for_node(&self, node: usize) -> &[usize] {
        self.node_jobs.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct racks hosting a job, in first-placement order
    pub fn job_racks(&self, job: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.placements(job)
            .iter()
            .filter(|p| seen.insert(p.rack))
            .map(|p| p.rack)
            .collect()
    }
}

/// Current risk of one placement's rack and node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementRisk {
    pub node: usize,
    pub rack: usize,
    pub gpus: u32,
    pub rack_score: u8,
    pub rack_level: RiskLevel,
    pub node_throttled: bool,
}

/// Derived risk of a job before it is attached to ids for display
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobRisk {
    pub infra_risk: RiskLevel,
    pub status: JobStatus,
    pub slowdown_pct: f64,
    pub assigned_gpus: u32,
    pub affected_gpus: u32,
    pub throttled_nodes: usize,
    /// Arena index of the highest-scoring hosting rack
    pub worst_rack: Option<usize>,
    pub worst_score: u8,
}

/// Derive a job's infra risk and slowdown from its placements.
///
/// Infra risk is the level of the worst hosting rack (max, not average). A
/// GPU counts as affected when its node is throttled or its rack is at or
/// above `affected_min_level`.
pub fn evaluate_job(
    base_status: JobStatus,
    placements: &[PlacementRisk],
    config: &PropagationConfig,
) -> JobRisk {
    let assigned_gpus: u32 = placements.iter().map(|p| p.gpus).sum();
    if assigned_gpus == 0 {
        return JobRisk {
            infra_risk: RiskLevel::None,
            status: base_status,
            slowdown_pct: 0.0,
            assigned_gpus: 0,
            affected_gpus: 0,
            throttled_nodes: 0,
            worst_rack: None,
            worst_score: 0,
        };
    }

    let worst = placements
        .iter()
        .fold(None::<&PlacementRisk>, |best, p| match best {
            Some(b) if b.rack_score >= p.rack_score => Some(b),
            _ => Some(p),
        });
    let (infra_risk, worst_rack, worst_score) = worst
        .map(|w| (w.rack_level, Some(w.rack), w.rack_score))
        .unwrap_or((RiskLevel::None, None, 0));

    let affected_gpus: u32 = placements
        .iter()
        .filter(|p| p.node_throttled || p.rack_level >= config.affected_min_level)
        .map(|p| p.gpus)
        .sum();
    let throttled_nodes = placements
        .iter()
        .filter(|p| p.node_throttled)
        .map(|p| p.node)
        .collect::<HashSet<_>>()
        .len();

    let raw = 100.0 * affected_gpus as f64 / assigned_gpus as f64
        * config.multipliers.for_level(infra_risk);
    let slowdown_pct = (raw.min(100.0) * 10.0).round() / 10.0;

    let status = if base_status == JobStatus::Running && infra_risk >= RiskLevel::Medium {
        JobStatus::AtRisk
    } else {
        base_status
    };

    JobRisk {
        infra_risk,
        status,
        slowdown_pct,
        assigned_gpus,
        affected_gpus,
        throttled_nodes,
        worst_rack,
        worst_score,
    }
}

/// Root-cause chain for a job's risk: hosting rack, cooling zone margin,
/// throttled nodes, job slowdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskTrace {
    pub rack: RackId,
    pub inlet_c: Option<f64>,
    pub rack_score: u8,
    pub rack_level: RiskLevel,
    pub cooling_zone: ZoneId,
    pub zone_margin_pct: Option<f64>,
    pub throttled_nodes: usize,
    pub affected_gpus: u32,
    pub assigned_gpus: u32,
    pub slowdown_pct: f64,
}

impl RiskTrace {
    /// One-line explanation of the chain
    pub fn explain(&self) -> String {
        let inlet = self
            .inlet_c
            .map(|t| format!("{:.1} °C inlet", t))
            .unwrap_or_else(|| "no inlet reading".to_string());
        let margin = self
            .zone_margin_pct
            .map(|m| format!("{:.0}% margin", m))
            .unwrap_or_else(|| "unknown margin".to_string());
        format!(
            "rack {} ({}, score {}, {}) -> {} ({}) -> {} throttled node(s), {}/{} GPUs affected -> {:.1}% slowdown",
            self.rack,
            inlet,
            self.rack_score,
            self.rack_level,
            self.cooling_zone,
            margin,
            self.throttled_nodes,
            self.affected_gpus,
            self.assigned_gpus,
            self.slowdown_pct
        )
    }
}
