//! Training job risk

use crate::output::{colorize_level, Formattable, OutputFormatter};
use crate::session::Session;
use anyhow::Result;
use uponline_core::JobId;
use uponline_state::snapshot::JobView;
use uponline_state::JobFilter;

impl Formattable for JobView {
    fn table_headers() -> Vec<String> {
        ["Job", "Cluster", "Status", "GPUs", "Racks", "Infra risk", "Slowdown"]
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.name.to_string(),
            self.cluster.to_string(),
            self.status.to_string(),
            self.assigned_gpus.to_string(),
            join(&self.racks),
            self.infra_risk.to_string(),
            format!("{:.1}%", self.slowdown_pct),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("Job".to_string(), self.name.to_string()),
            ("Cluster".to_string(), self.cluster.to_string()),
            ("Status".to_string(), self.status.to_string()),
            ("Assigned GPUs".to_string(), self.assigned_gpus.to_string()),
            ("Racks".to_string(), join(&self.racks)),
            ("Infra risk".to_string(), colorize_level(self.infra_risk).to_string()),
            ("Slowdown risk".to_string(), format!("{:.1}%", self.slowdown_pct)),
            (
                "Expected end".to_string(),
                self.expected_end
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ];
        if let Some(trace) = &self.trace {
            pairs.push(("Cause".to_string(), trace.explain()));
        }
        pairs
    }
}

fn join<T: ToString>(items: &[T]) -> String {
    if items.is_empty() {
        return "-".to_string();
    }
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

pub fn list_jobs(session: &Session, filter: &JobFilter, formatter: &OutputFormatter) -> Result<()> {
    let jobs = session.query().list_jobs(filter)?;
    formatter.print_list(&jobs)
}

/// Show one job with the rack/zone chain behind its risk
pub fn describe_job(session: &Session, name: &str, formatter: &OutputFormatter) -> Result<()> {
    let job = session.query().get_job(&JobId::from(name))?;
    formatter.print_item(&job)
}
