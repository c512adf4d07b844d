//! What-if projection of a change's effect on its racks
//!
//! Advisory only: the projection is shown to the approver next to the check
//! results and never changes the verdict.

use crate::checks::RackImpact;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uponline_core::config::ValidatorConfig;
use uponline_core::{RackId, RiskLevel};
use uponline_state::scoring::ScoreInputs;
use uponline_state::{RackScorer, Snapshot};

/// Current, projected and rated values for one rack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RackProjection {
    pub rack: RackId,
    pub current_power_kw: Option<f64>,
    pub projected_power_kw: Option<f64>,
    pub rated_power_kw: f64,
    pub current_inlet_c: Option<f64>,
    pub projected_inlet_c: Option<f64>,
    pub max_inlet_c: f64,
    pub current_score: u8,
    pub projected_score: Option<u8>,
    pub projected_level: Option<RiskLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    pub racks: Vec<RackProjection>,
    /// Time budget ran out before every rack was projected
    pub partial: bool,
}

#[derive(Debug, Clone)]
pub struct Simulator {
    scorer: RackScorer,
    inlet_rise_per_kw: f64,
}

impl Simulator {
    pub fn new(scorer: RackScorer, config: &ValidatorConfig) -> Self {
        Self {
            scorer,
            inlet_rise_per_kw: config.inlet_rise_per_kw,
        }
    }

    /// Inlet temperature after adding `thermal_kw` of heat to a rack in a
    /// zone already using `used_fraction` of its cooling
    pub fn projected_inlet(&self, current_c: f64, thermal_kw: f64, used_fraction: f64) -> f64 {
        current_c + thermal_kw * self.inlet_rise_per_kw * (1.0 + used_fraction.max(0.0))
    }

    pub fn project(&self, snapshot: &Snapshot, impacts: &[RackImpact], deadline: Instant) -> Simulation {
        let mut simulation = Simulation::default();
        for impact in impacts {
            if Instant::now() >= deadline {
                simulation.partial = true;
                break;
            }
            let Some(rack) = snapshot.rack(&impact.rack) else {
                continue;
            };
            let used_fraction = snapshot
                .zone(&impact.cooling_zone)
                .map(|z| z.used_fraction())
                .unwrap_or(1.0);

            let projected_power_kw = rack.power_kw.map(|kw| (kw + impact.deltas.power_kw).max(0.0));
            let projected_inlet_c = rack
                .inlet_c
                .map(|c| self.projected_inlet(c, impact.deltas.thermal_kw, used_fraction));
            let projected = (projected_inlet_c.is_some() || projected_power_kw.is_some()).then(|| {
                self.scorer.score(&ScoreInputs {
                    inlet_c: projected_inlet_c,
                    power_kw: projected_power_kw,
                    pdu_capacity_kw: rack.pdu_capacity_kw,
                    volatility: rack.breakdown.map(|b| b.volatility).unwrap_or_default(),
                })
            });

            simulation.racks.push(RackProjection {
                rack: rack.id.clone(),
                current_power_kw: rack.power_kw,
                projected_power_kw,
                rated_power_kw: rack.pdu_capacity_kw,
                current_inlet_c: rack.inlet_c,
                projected_inlet_c,
                max_inlet_c: self.scorer.config().thermal_ceiling_c,
                current_score: rack.risk_score,
                projected_score: projected.map(|b| b.score),
                projected_level: projected.map(|b| self.scorer.level(b.score)),
            });
        }
        simulation
    }
}
