//! Active risk list and fleet summary

use crate::output::{colorize_severity, format_percentage, Formattable, OutputFormatter};
use crate::session::Session;
use anyhow::Result;
use serde::Serialize;
use uponline_core::RiskSeverity;
use uponline_state::snapshot::{ActiveRisk, FleetSummary};

impl Formattable for ActiveRisk {
    fn table_headers() -> Vec<String> {
        ["Severity", "Risk", "Location", "Score", "Trend", "Detail"]
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.severity.to_string(),
            self.kind.to_string(),
            self.location.clone(),
            self.risk_score.to_string(),
            format!("{:?}", self.trend),
            self.detail.clone(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("ID".to_string(), self.id.clone()),
            ("Severity".to_string(), colorize_severity(self.severity).to_string()),
            ("Risk".to_string(), self.kind.to_string()),
            ("Location".to_string(), self.location.clone()),
            ("Score".to_string(), self.risk_score.to_string()),
            ("Detail".to_string(), self.detail.clone()),
        ]
    }
}

#[derive(Debug, Serialize)]
struct RiskReport<'a> {
    snapshot_version: u64,
    summary: &'a FleetSummary,
    risks: &'a [ActiveRisk],
}

pub fn summary_stats(summary: &FleetSummary) -> Vec<(String, String)> {
    vec![
        ("Average rack risk".to_string(), format!("{:.1}", summary.average_rack_risk)),
        (
            "Facility power headroom".to_string(),
            format_percentage(summary.facility_power_headroom_pct),
        ),
        ("GPU fleet health".to_string(), format_percentage(summary.gpu_fleet_health_pct)),
        ("Jobs at risk".to_string(), summary.at_risk_jobs.to_string()),
        ("Critical risks".to_string(), summary.critical_risks.to_string()),
        ("Stale racks".to_string(), summary.stale_racks.to_string()),
    ]
}

/// Show the active risk list at or above `min_severity`
pub fn show_risks(
    session: &Session,
    min_severity: RiskSeverity,
    formatter: &OutputFormatter,
) -> Result<()> {
    let snapshot = session.query().pinned()?;
    let risks: Vec<ActiveRisk> = snapshot
        .active_risks
        .iter()
        .filter(|r| r.severity >= min_severity)
        .cloned()
        .collect();

    if formatter.is_structured() {
        return formatter.print_structured(&RiskReport {
            snapshot_version: snapshot.version,
            summary: &snapshot.summary,
            risks: &risks,
        });
    }

    formatter.print_stats(&summary_stats(&snapshot.summary))?;
    formatter.print_heading(&format!("Active risks (snapshot v{})", snapshot.version));
    formatter.print_list(&risks)
}
