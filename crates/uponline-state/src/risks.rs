//! Active risk list and fleet summary derived from snapshot views

use crate::scoring::ScoreFactor;
use crate::snapshot::{
    ActiveRisk, FleetSummary, JobView, NodeView, PowerDomainView, RackView, RiskKind, ZoneView,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uponline_core::config::{RiskListConfig, ScoringConfig};
use uponline_core::{JobStatus, NodeHealth, RackId, RiskSeverity, Trend, ZoneId};

/// Severity of a score, or `None` when it is below the listing threshold
pub fn severity_for(score: u8, thresholds: &RiskListConfig) -> Option<RiskSeverity> {
    if score >= thresholds.critical {
        Some(RiskSeverity::Critical)
    } else if score >= thresholds.warning {
        Some(RiskSeverity::Warning)
    } else if score >= thresholds.info {
        Some(RiskSeverity::Info)
    } else {
        None
    }
}

fn slug(kind: RiskKind) -> &'static str {
    match kind {
        RiskKind::ThermalExceedance => "thermal-exceedance",
        RiskKind::ThermalMarginLow => "thermal-margin",
        RiskKind::PowerHeadroomLow => "power-headroom",
        RiskKind::LoadVolatility => "load-volatility",
        RiskKind::CoolingMarginNarrowing => "cooling-margin",
        RiskKind::GpuThermalThrottling => "gpu-throttling",
        RiskKind::StaleTelemetry => "stale-telemetry",
    }
}

pub struct RiskInputs<'a> {
    pub racks: &'a BTreeMap<RackId, RackView>,
    pub zones: &'a BTreeMap<ZoneId, ZoneView>,
    pub nodes: &'a [&'a NodeView],
    pub scoring: &'a ScoringConfig,
    pub thresholds: &'a RiskListConfig,
}

pub fn derive_active_risks(inputs: &RiskInputs<'_>) -> Vec<ActiveRisk> {
    let mut risks = Vec::new();
    let mut push = |kind: RiskKind,
                    subject: &str,
                    location: String,
                    score: u8,
                    trend: Trend,
                    detail: String,
                    last_updated: Option<DateTime<Utc>>| {
        if let Some(severity) = severity_for(score, inputs.thresholds) {
            risks.push(ActiveRisk {
                id: format!("{}:{}", slug(kind), subject),
                severity,
                kind,
                location,
                risk_score: score,
                trend,
                detail,
                last_updated,
            });
        }
    };

    for rack in inputs.racks.values().filter(|r| !r.retired) {
        let location = format!("Rack {} / {}", rack.id, rack.cooling_zone);

        if rack.stale {
            let since = rack
                .last_sample
                .map(|t| format!("since {}", t.format("%Y-%m-%d %H:%M:%S UTC")))
                .unwrap_or_else(|| "since topology load".to_string());
            push(
                RiskKind::StaleTelemetry,
                rack.id.as_str(),
                location.clone(),
                rack.risk_score.max(inputs.thresholds.warning),
                rack.trend,
                format!("No telemetry {}; score frozen at {}", since, rack.risk_score),
                rack.last_sample,
            );
        }

        let Some(breakdown) = rack.breakdown else {
            continue;
        };
        let inlet = rack.inlet_c.unwrap_or_default();
        let (kind, detail) = if breakdown.above_ceiling {
            (
                RiskKind::ThermalExceedance,
                format!(
                    "Inlet {:.1} °C exceeds the {:.0} °C ceiling",
                    inlet, inputs.scoring.thermal_ceiling_c
                ),
            )
        } else {
            match breakdown.dominant {
                ScoreFactor::Thermal => (
                    RiskKind::ThermalMarginLow,
                    format!(
                        "Inlet {:.1} °C, {:.0}% thermal margin",
                        inlet,
                        breakdown.thermal_margin_pct.unwrap_or_default()
                    ),
                ),
                ScoreFactor::Power => (
                    RiskKind::PowerHeadroomLow,
                    format!(
                        "{:.1} of {:.1} kW on {}{}",
                        rack.power_kw.unwrap_or_default(),
                        rack.pdu_capacity_kw,
                        rack.pdu,
                        if rack.inlet_c.is_none() {
                            ", no inlet temperature reported"
                        } else {
                            ""
                        }
                    ),
                ),
                ScoreFactor::Volatility => (
                    RiskKind::LoadVolatility,
                    format!("Volatility sub-score {:.0}", breakdown.volatility),
                ),
            }
        };
        push(
            kind,
            rack.id.as_str(),
            location,
            rack.risk_score,
            rack.trend,
            detail,
            rack.last_sample,
        );
    }

    for zone in inputs.zones.values() {
        let margin = zone
            .margin_pct
            .map(|m| format!("{:.0}% cooling margin", m))
            .unwrap_or_else(|| "no effective cooling capacity".to_string());
        let worst = zone
            .worst_unit
            .as_ref()
            .and_then(|name| zone.crah_units.iter().find(|u| &u.name == name))
            .map(|u| format!(", weakest unit {} ({:?})", u.name, u.status))
            .unwrap_or_default();
        let last_updated = zone
            .racks
            .iter()
            .filter_map(|r| inputs.racks.get(r).and_then(|v| v.last_sample))
            .max();
        push(
            RiskKind::CoolingMarginNarrowing,
            zone.name.as_str(),
            zone.name.to_string(),
            zone.risk_score,
            Trend::Stable,
            format!("{}{}", margin, worst),
            last_updated,
        );
    }

    for node in inputs.nodes.iter().filter(|n| n.thermal_anomaly) {
        push(
            RiskKind::GpuThermalThrottling,
            node.hostname.as_str(),
            format!("{} / Rack {} / {}", node.hostname, node.rack, node.cluster),
            node.risk_score,
            Trend::Stable,
            format!(
                "GPU temperature {:.0} °C",
                node.gpu_temperature_c.unwrap_or_default()
            ),
            node.last_sample,
        );
    }

    risks.sort_by(|a, b| b.risk_score.cmp(&a.risk_score).then_with(|| a.id.cmp(&b.id)));
    risks
}

pub fn fleet_summary<'a>(
    racks: impl Iterator<Item = &'a RackView>,
    power_domains: impl Iterator<Item = &'a PowerDomainView>,
    nodes: impl Iterator<Item = &'a NodeView>,
    jobs: impl Iterator<Item = &'a JobView>,
    risks: &[ActiveRisk],
) -> FleetSummary {
    let mut scored = 0usize;
    let mut score_sum = 0u64;
    let mut stale_racks = 0usize;
    for rack in racks.filter(|r| !r.retired) {
        if rack.breakdown.is_some() {
            scored += 1;
            score_sum += u64::from(rack.risk_score);
        }
        if rack.stale {
            stale_racks += 1;
        }
    }
    let average_rack_risk = if scored == 0 {
        0.0
    } else {
        (score_sum as f64 / scored as f64 * 10.0).round() / 10.0
    };

    let (capacity, load) = power_domains
        .filter(|d| d.parent.is_none())
        .fold((0.0, 0.0), |(c, l), d| (c + d.rated_capacity_kw, l + d.load_kw));
    let facility_power_headroom_pct = (capacity > 0.0).then(|| 100.0 * (capacity - load) / capacity);

    let (reporting, healthy) = nodes
        .filter(|n| n.last_sample.is_some())
        .fold((0usize, 0usize), |(r, h), n| {
            (r + 1, h + usize::from(n.health == NodeHealth::Healthy))
        });
    let gpu_fleet_health_pct = (reporting > 0).then(|| 100.0 * healthy as f64 / reporting as f64);

    FleetSummary {
        average_rack_risk,
        facility_power_headroom_pct,
        gpu_fleet_health_pct,
        at_risk_jobs: jobs.filter(|j| j.status == JobStatus::AtRisk).count(),
        stale_racks,
        critical_risks: risks
            .iter()
            .filter(|r| r.severity == RiskSeverity::Critical)
            .count(),
    }
}
