//! GPU cluster health

use crate::output::{
    colorize_level, colorize_readiness, format_optional, format_percentage, Formattable,
    OutputFormatter,
};
use crate::session::Session;
use anyhow::Result;
use uponline_state::snapshot::ClusterView;

impl Formattable for ClusterView {
    fn table_headers() -> Vec<String> {
        [
            "Cluster", "GPU model", "GPUs", "Readiness", "Rack risk", "Healthy", "Warning",
            "Critical", "Anomalies", "Driver drift", "NVLink", "Avg GPU temp",
        ]
        .iter()
        .map(|h| h.to_string())
        .collect()
    }

    fn table_row(&self) -> Vec<String> {
        let h = &self.health;
        vec![
            self.name.to_string(),
            self.gpu_model.clone(),
            self.gpu_count.to_string(),
            h.readiness.to_string(),
            format!("{} ({})", self.max_rack_score, self.risk_level),
            format!("{}/{}", h.healthy_nodes, h.node_count),
            h.warning_nodes.to_string(),
            h.critical_nodes.to_string(),
            h.thermal_anomalies.to_string(),
            h.driver_drift.to_string(),
            format_percentage(h.nvlink_health_pct),
            format_optional(h.avg_gpu_temperature_c, " °C"),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        let h = &self.health;
        vec![
            ("Cluster".to_string(), self.name.to_string()),
            ("GPU model".to_string(), self.gpu_model.clone()),
            ("Readiness".to_string(), colorize_readiness(h.readiness).to_string()),
            (
                "Worst rack risk".to_string(),
                format!("{} ({})", self.max_rack_score, colorize_level(self.risk_level)),
            ),
            ("Reporting nodes".to_string(), format!("{}/{}", h.reporting_nodes, h.node_count)),
            ("Driver drift".to_string(), h.driver_drift.to_string()),
            ("Avg utilization".to_string(), format_percentage(h.avg_utilization_pct)),
        ]
    }
}

pub fn list_clusters(session: &Session, formatter: &OutputFormatter) -> Result<()> {
    let clusters = session.query().list_clusters()?;
    formatter.print_list(&clusters)
}
