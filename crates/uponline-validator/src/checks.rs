//! Constraint checks run against a proposed change
//!
//! Every check reads one pinned snapshot and one pinned schedule view and
//! returns a single result: for changes touching several racks it reports the
//! worst of the per-asset results. Missing topology is an error, never a
//! silent pass.

use crate::change::{ChangeDeltas, ChangeId, ChangeSpec, ChangeTarget, ScheduledWindow};
use crate::registry::ScheduleView;
use crate::{Result, ValidatorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use uponline_core::config::ValidatorConfig;
use uponline_core::topology::Topology;
use uponline_core::{PowerDomainId, RackId, RiskLevel, ZoneId};
use uponline_state::Snapshot;

/// Result of a single constraint check. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CheckOutcome {
    Pass,
    Warning,
    Fail,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOutcome::Pass => write!(f, "Pass"),
            CheckOutcome::Warning => write!(f, "Warning"),
            CheckOutcome::Fail => write!(f, "Fail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckKind {
    PowerHeadroom,
    CoolingCapacity,
    RedundancyMargin,
    SchedulingConflict,
    JobExposure,
}

impl CheckKind {
    /// Checks whose outcome depends on facility load, and so on the window
    pub fn is_load_bound(&self) -> bool {
        matches!(
            self,
            CheckKind::PowerHeadroom | CheckKind::CoolingCapacity | CheckKind::RedundancyMargin
        )
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::PowerHeadroom => write!(f, "Power headroom"),
            CheckKind::CoolingCapacity => write!(f, "Cooling capacity"),
            CheckKind::RedundancyMargin => write!(f, "Redundancy margin"),
            CheckKind::SchedulingConflict => write!(f, "Scheduling conflict"),
            CheckKind::JobExposure => write!(f, "Training job exposure"),
        }
    }
}

/// Outcome of one check within one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub outcome: CheckOutcome,
    /// Asset the result is about
    pub subject: String,
    pub explanation: String,
    /// Headroom or margin percentage the decision was made on
    pub headroom_pct: Option<f64>,
}

impl CheckResult {
    fn new(
        check: CheckKind,
        outcome: CheckOutcome,
        subject: impl Into<String>,
        explanation: impl Into<String>,
        headroom_pct: Option<f64>,
    ) -> Self {
        Self {
            check,
            outcome,
            subject: subject.into(),
            explanation: explanation.into(),
            headroom_pct,
        }
    }
}

/// Worst outcome first; among equals, the smallest headroom
fn worst_of(check: CheckKind, results: Vec<CheckResult>) -> Result<CheckResult> {
    results
        .into_iter()
        .max_by(|a, b| {
            a.outcome.cmp(&b.outcome).then_with(|| {
                let ha = a.headroom_pct.unwrap_or(f64::INFINITY);
                let hb = b.headroom_pct.unwrap_or(f64::INFINITY);
                hb.total_cmp(&ha)
            })
        })
        .ok_or_else(|| insufficient(check, "no assets to evaluate"))
}

fn insufficient(check: CheckKind, detail: impl Into<String>) -> ValidatorError {
    ValidatorError::InsufficientTopology {
        check: check.to_string(),
        detail: detail.into(),
    }
}

fn grade(remaining: f64, margin_pct: f64, warn_below_pct: f64) -> CheckOutcome {
    if remaining < 0.0 {
        CheckOutcome::Fail
    } else if margin_pct < warn_below_pct {
        CheckOutcome::Warning
    } else {
        CheckOutcome::Pass
    }
}

/// Load change a request places on one rack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RackImpact {
    pub rack: RackId,
    pub cooling_zone: ZoneId,
    pub pdu: PowerDomainId,
    pub deltas: ChangeDeltas,
}

/// Racks touched by `spec` with their share of the deltas
pub fn resolve_impacts(spec: &ChangeSpec, topology: &Topology) -> Result<Vec<RackImpact>> {
    let impact = |id: &RackId, deltas: ChangeDeltas| -> Result<RackImpact> {
        let rack = topology.rack(id).ok_or_else(|| ValidatorError::InsufficientTopology {
            check: "target resolution".to_string(),
            detail: format!("rack {} is not in the topology", id),
        })?;
        Ok(RackImpact {
            rack: rack.id.clone(),
            cooling_zone: rack.cooling_zone.clone(),
            pdu: rack.pdu.clone(),
            deltas,
        })
    };

    let mut impacts = match &spec.target {
        ChangeTarget::Rack(id) => vec![impact(id, spec.deltas)?],
        ChangeTarget::Cluster(name) => {
            if topology.cluster(name).is_none() {
                return Err(ValidatorError::InsufficientTopology {
                    check: "target resolution".to_string(),
                    detail: format!("cluster {} is not in the topology", name),
                });
            }
            let racks: Vec<&RackId> = topology
                .cluster_racks(name)
                .into_iter()
                .filter(|r| !r.retired)
                .map(|r| &r.id)
                .collect();
            if racks.is_empty() {
                return Err(ValidatorError::InsufficientTopology {
                    check: "target resolution".to_string(),
                    detail: format!("cluster {} has no nodes on active racks", name),
                });
            }
            let share = spec.deltas.split(racks.len());
            racks
                .into_iter()
                .map(|id| impact(id, share))
                .collect::<Result<Vec<_>>>()?
        }
    };

    if let Some(source) = &spec.source {
        impacts.push(impact(source, spec.deltas.negated())?);
    }
    Ok(impacts)
}

/// Racks a request touches, for overlap detection. Unresolvable targets
/// touch nothing.
pub fn touched_racks(spec: &ChangeSpec, topology: &Topology) -> BTreeSet<RackId> {
    let mut racks: BTreeSet<RackId> = match &spec.target {
        ChangeTarget::Rack(id) => [id.clone()].into_iter().collect(),
        ChangeTarget::Cluster(name) => topology
            .cluster_racks(name)
            .into_iter()
            .map(|r| r.id.clone())
            .collect(),
    };
    if let Some(source) = &spec.source {
        racks.insert(source.clone());
    }
    racks
}

/// Everything a check may read
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub change_id: &'a ChangeId,
    pub spec: &'a ChangeSpec,
    /// Window under evaluation; differs from the request's own during a
    /// safer-window scan
    pub window: ScheduledWindow,
    pub impacts: &'a [RackImpact],
    pub snapshot: &'a Snapshot,
    pub schedule: &'a ScheduleView,
    pub config: &'a ValidatorConfig,
    /// Multiplier applied to current facility load
    pub load_factor: f64,
}

pub trait ConstraintCheck: Send + Sync + fmt::Debug {
    fn kind(&self) -> CheckKind;

    fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<CheckResult>;
}

/// The five checks, in reporting order
pub fn default_pipeline() -> Vec<Arc<dyn ConstraintCheck>> {
    vec![
        Arc::new(PowerHeadroomCheck),
        Arc::new(CoolingCapacityCheck),
        Arc::new(RedundancyCheck),
        Arc::new(SchedulingConflictCheck),
        Arc::new(JobExposureCheck),
    ]
}

/// Target PDU capacity minus current load minus the declared power delta
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerHeadroomCheck;

impl ConstraintCheck for PowerHeadroomCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::PowerHeadroom
    }

    fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<CheckResult> {
        let kind = self.kind();
        let mut by_pdu: BTreeMap<&PowerDomainId, (f64, bool)> = BTreeMap::new();
        for impact in ctx.impacts {
            let rack = ctx
                .snapshot
                .rack(&impact.rack)
                .ok_or_else(|| insufficient(kind, format!("rack {} has no state", impact.rack)))?;
            let entry = by_pdu.entry(&impact.pdu).or_insert((0.0, true));
            entry.0 += impact.deltas.power_kw;
            entry.1 &= rack.power_kw.is_some();
        }

        let mut results = Vec::new();
        for (pdu, (delta, reporting)) in by_pdu {
            let domain = ctx
                .snapshot
                .power_domain(pdu)
                .ok_or_else(|| insufficient(kind, format!("power domain {} has no state", pdu)))?;
            let capacity = domain.rated_capacity_kw;
            if capacity <= 0.0 {
                return Err(insufficient(kind, format!("{} has no rated capacity", pdu)));
            }
            if !reporting {
                results.push(CheckResult::new(
                    kind,
                    CheckOutcome::Warning,
                    pdu.as_str(),
                    format!("{}: no power reading for the target rack, headroom unverified", pdu),
                    None,
                ));
                continue;
            }

            let load = domain.load_kw * ctx.load_factor;
            let remaining = capacity - load - delta;
            let pct = 100.0 * remaining / capacity;
            results.push(CheckResult::new(
                kind,
                grade(remaining, pct, ctx.config.power_warn_headroom_pct),
                pdu.as_str(),
                format!(
                    "{}: {:.1} kW load {:+.1} kW leaves {:.1} of {:.1} kW ({:.1}% headroom)",
                    pdu, load, delta, remaining, capacity, pct
                ),
                Some(pct),
            ));
        }
        worst_of(kind, results)
    }
}

/// Zone cooling margin after the declared thermal delta
#[derive(Debug, Clone, Copy, Default)]
pub struct CoolingCapacityCheck;

fn thermal_by_zone<'a>(impacts: &'a [RackImpact]) -> BTreeMap<&'a ZoneId, f64> {
    let mut zones = BTreeMap::new();
    for impact in impacts {
        *zones.entry(&impact.cooling_zone).or_insert(0.0) += impact.deltas.thermal_kw;
    }
    zones
}

impl ConstraintCheck for CoolingCapacityCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::CoolingCapacity
    }

    fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<CheckResult> {
        let kind = self.kind();
        let mut results = Vec::new();
        for (name, delta) in thermal_by_zone(ctx.impacts) {
            let zone = ctx
                .snapshot
                .zone(name)
                .ok_or_else(|| insufficient(kind, format!("cooling zone {} has no state", name)))?;
            let capacity = zone.effective_capacity_kw;
            let heat = zone.heat_load_kw * ctx.load_factor + delta;
            if capacity <= 0.0 {
                results.push(CheckResult::new(
                    kind,
                    CheckOutcome::Fail,
                    name.as_str(),
                    format!("{}: no effective cooling capacity", name),
                    None,
                ));
                continue;
            }

            let remaining = capacity - heat;
            let margin = 100.0 * remaining / capacity;
            results.push(CheckResult::new(
                kind,
                grade(remaining, margin, ctx.config.cooling_warn_margin_pct),
                name.as_str(),
                format!(
                    "{}: {:.1} kW heat {:+.1} kW against {:.1} kW effective cooling ({:.1}% margin)",
                    name,
                    zone.heat_load_kw * ctx.load_factor,
                    delta,
                    capacity,
                    margin
                ),
                Some(margin),
            ));
        }
        worst_of(kind, results)
    }
}

/// N+1 power at the nearest redundant ancestor and N+1 cooling in the zone
#[derive(Debug, Clone, Copy, Default)]
pub struct RedundancyCheck;

impl RedundancyCheck {
    fn power(&self, ctx: &CheckContext<'_>, results: &mut Vec<CheckResult>) -> Result<()> {
        let kind = CheckKind::RedundancyMargin;
        let topology = &ctx.snapshot.topology;
        let mut by_domain: BTreeMap<PowerDomainId, f64> = BTreeMap::new();

        for impact in ctx.impacts {
            let redundant = topology.power_path(&impact.pdu).into_iter().find_map(|d| {
                ctx.snapshot
                    .power_domain(&d.id)
                    .filter(|v| v.n_plus_one_capacity_kw().is_some())
            });
            match redundant {
                Some(domain) => {
                    *by_domain.entry(domain.id.clone()).or_insert(0.0) += impact.deltas.power_kw;
                }
                None => results.push(CheckResult::new(
                    kind,
                    CheckOutcome::Warning,
                    impact.pdu.as_str(),
                    format!("power redundancy not modelled above {}", impact.pdu),
                    None,
                )),
            }
        }

        for (id, delta) in by_domain {
            let domain = ctx
                .snapshot
                .power_domain(&id)
                .ok_or_else(|| insufficient(kind, format!("power domain {} has no state", id)))?;
            let n_plus_one = domain.n_plus_one_capacity_kw().unwrap_or_default();
            let load = domain.load_kw * ctx.load_factor + delta;
            if n_plus_one <= 0.0 {
                results.push(CheckResult::new(
                    kind,
                    CheckOutcome::Fail,
                    id.as_str(),
                    format!("{}: no capacity left after losing one unit", id),
                    None,
                ));
                continue;
            }
            let remaining = n_plus_one - load;
            let margin = 100.0 * remaining / n_plus_one;
            results.push(CheckResult::new(
                kind,
                grade(remaining, margin, ctx.config.redundancy_warn_pct),
                id.as_str(),
                format!(
                    "{}: {:.1} kW against {:.1} kW N+1 capacity ({:.1}% margin)",
                    id, load, n_plus_one, margin
                ),
                Some(margin),
            ));
        }
        Ok(())
    }

    fn cooling(&self, ctx: &CheckContext<'_>, results: &mut Vec<CheckResult>) -> Result<()> {
        let kind = CheckKind::RedundancyMargin;
        for (name, delta) in thermal_by_zone(ctx.impacts) {
            let zone = ctx
                .snapshot
                .zone(name)
                .ok_or_else(|| insufficient(kind, format!("cooling zone {} has no state", name)))?;
            if zone.crah_units.len() < 2 {
                results.push(CheckResult::new(
                    kind,
                    CheckOutcome::Warning,
                    name.as_str(),
                    format!("{}: cooling redundancy not modelled (single CRAH unit)", name),
                    None,
                ));
                continue;
            }

            let n_plus_one = zone.effective_capacity_kw - zone.largest_unit_kw;
            let heat = zone.heat_load_kw * ctx.load_factor + delta;
            if n_plus_one <= 0.0 {
                results.push(CheckResult::new(
                    kind,
                    CheckOutcome::Fail,
                    name.as_str(),
                    format!("{}: no cooling left after losing the largest unit", name),
                    None,
                ));
                continue;
            }
            let remaining = n_plus_one - heat;
            let margin = 100.0 * remaining / n_plus_one;
            results.push(CheckResult::new(
                kind,
                grade(remaining, margin, ctx.config.redundancy_warn_pct),
                name.as_str(),
                format!(
                    "{}: {:.1} kW heat against {:.1} kW N+1 cooling ({:.1}% margin)",
                    name, heat, n_plus_one, margin
                ),
                Some(margin),
            ));
        }
        Ok(())
    }
}

impl ConstraintCheck for RedundancyCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::RedundancyMargin
    }

    fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<CheckResult> {
        let mut results = Vec::new();
        self.power(ctx, &mut results)?;
        self.cooling(ctx, &mut results)?;
        worst_of(self.kind(), results)
    }
}

/// No other reserving request touches the same racks in an overlapping window
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulingConflictCheck;

impl ConstraintCheck for SchedulingConflictCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::SchedulingConflict
    }

    fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<CheckResult> {
        let topology = &ctx.snapshot.topology;
        let mine: BTreeSet<RackId> = ctx.impacts.iter().map(|i| i.rack.clone()).collect();
        let subject = ctx.spec.target.to_string();

        let conflicts: Vec<String> = ctx
            .schedule
            .reserving(ctx.change_id)
            .filter(|other| other.spec.window.overlaps(&ctx.window))
            .filter_map(|other| {
                let shared: Vec<String> = touched_racks(&other.spec, topology)
                    .intersection(&mine)
                    .map(|r| r.to_string())
                    .collect();
                (!shared.is_empty()).then(|| {
                    format!(
                        "{} ({}, racks {}, {})",
                        other.id,
                        other.state,
                        shared.join(", "),
                        other.spec.window
                    )
                })
            })
            .collect();

        if conflicts.is_empty() {
            Ok(CheckResult::new(
                self.kind(),
                CheckOutcome::Pass,
                subject,
                format!("no overlapping changes during {}", ctx.window),
                None,
            ))
        } else {
            Ok(CheckResult::new(
                self.kind(),
                CheckOutcome::Fail,
                subject,
                format!("overlaps {}", conflicts.join("; ")),
                None,
            ))
        }
    }
}

/// Running jobs with infrastructure risk hosted on the target during the window
#[derive(Debug, Clone, Copy, Default)]
pub struct JobExposureCheck;

impl ConstraintCheck for JobExposureCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::JobExposure
    }

    fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<CheckResult> {
        let kind = self.kind();
        let targets: BTreeSet<&RackId> = ctx.impacts.iter().map(|i| &i.rack).collect();

        let mut results: Vec<CheckResult> = ctx
            .snapshot
            .jobs
            .values()
            .filter(|job| job.status.is_running() && job.infra_risk > RiskLevel::None)
            .filter(|job| job.expected_end.map_or(true, |end| end > ctx.window.start))
            .filter_map(|job| {
                let hosted: Vec<String> = job
                    .racks
                    .iter()
                    .filter(|r| targets.contains(r))
                    .map(|r| r.to_string())
                    .collect();
                if hosted.is_empty() {
                    return None;
                }
                let outcome = if job.infra_risk >= RiskLevel::High {
                    CheckOutcome::Fail
                } else {
                    CheckOutcome::Warning
                };
                Some(CheckResult::new(
                    kind,
                    outcome,
                    job.name.as_str(),
                    format!(
                        "{} ({} infra risk, {:.1}% slowdown risk) runs on rack {}",
                        job.name,
                        job.infra_risk,
                        job.slowdown_pct,
                        hosted.join(", ")
                    ),
                    None,
                ))
            })
            .collect();

        if results.is_empty() {
            results.push(CheckResult::new(
                kind,
                CheckOutcome::Pass,
                ctx.spec.target.to_string(),
                "no running job with infrastructure risk on the target",
                None,
            ));
        }
        worst_of(kind, results)
    }
}
