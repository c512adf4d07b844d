//! Change request validation

use crate::output::{colorize_outcome, colorize_overall, format_optional, Formattable, OutputFormatter};
use crate::session::Session;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use uponline_validator::{ChangeRequest, ChangeSpec, CheckResult, Overall, RackProjection, Verdict};

impl Formattable for CheckResult {
    fn table_headers() -> Vec<String> {
        ["Check", "Outcome", "Subject", "Headroom", "Explanation"]
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.check.to_string(),
            format!("{:?}", self.outcome),
            self.subject.clone(),
            format_optional(self.headroom_pct, "%"),
            self.explanation.clone(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("Check".to_string(), self.check.to_string()),
            ("Outcome".to_string(), colorize_outcome(self.outcome).to_string()),
            ("Subject".to_string(), self.subject.clone()),
            ("Explanation".to_string(), self.explanation.clone()),
        ]
    }
}

impl Formattable for RackProjection {
    fn table_headers() -> Vec<String> {
        ["Rack", "Power now", "Power after", "Rated", "Inlet now", "Inlet after", "Score", "Level after"]
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.rack.to_string(),
            format_optional(self.current_power_kw, " kW"),
            format_optional(self.projected_power_kw, " kW"),
            format!("{:.0} kW", self.rated_power_kw),
            format_optional(self.current_inlet_c, " °C"),
            format_optional(self.projected_inlet_c, " °C"),
            match self.projected_score {
                Some(after) => format!("{} -> {}", self.current_score, after),
                None => self.current_score.to_string(),
            },
            self.projected_level
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("Rack".to_string(), self.rack.to_string()),
            ("Projected power".to_string(), format_optional(self.projected_power_kw, " kW")),
            ("Projected inlet".to_string(), format_optional(self.projected_inlet_c, " °C")),
        ]
    }
}

#[derive(Debug, Serialize)]
struct ValidationReport<'a> {
    verdict: &'a Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<&'a ChangeRequest>,
}

/// Validate the change request in `path` against the current snapshot.
/// With `approve`, a non-failing verdict is approved straight away.
pub fn validate_change(
    session: &Session,
    path: &Path,
    approve: bool,
    formatter: &OutputFormatter,
) -> Result<Verdict> {
    let spec = ChangeSpec::from_file(path)
        .with_context(|| format!("Failed to load change request: {}", path.display()))?;
    let validator = session.validator()?;
    let verdict = validator.submit(spec)?;

    let approved = if approve && verdict.overall != Overall::Fail {
        Some(validator.approve(&verdict.change_id)?)
    } else {
        None
    };

    if formatter.is_structured() {
        formatter.print_structured(&ValidationReport {
            verdict: &verdict,
            request: approved.as_ref(),
        })?;
        return Ok(verdict);
    }

    println!(
        "Change {} at snapshot v{}: {}",
        verdict.change_id,
        verdict.snapshot_version,
        colorize_overall(verdict.overall)
    );
    formatter.print_list(&verdict.checks)?;

    formatter.print_heading("Projected impact");
    formatter.print_list(&verdict.simulation.racks)?;

    if let Some(scan) = &verdict.window_scan {
        match &scan.suggestion {
            Some(s) => formatter.print_info(&format!(
                "Safer window: {} (load factor {:.2})",
                s.window, s.load_factor
            ))?,
            None => formatter.print_warning(&format!(
                "No window within the lookahead clears every constraint ({} scanned)",
                scan.candidates_scanned
            ))?,
        }
    }
    if verdict.partial {
        formatter.print_warning("Time budget exhausted: results are partial")?;
    }

    match (approve, &approved) {
        (_, Some(request)) => {
            formatter.print_success(&format!("Change {} is {}", request.id, request.state))?
        }
        (true, None) => formatter.print_warning("Failed changes cannot be approved")?,
        (false, None) => {}
    }

    Ok(verdict)
}
