//! Rack mapping CSV import

use crate::output::{Formattable, OutputFormatter};
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use uponline_core::topology::RackSpec;
use uponline_core::Topology;

impl Formattable for RackSpec {
    fn table_headers() -> Vec<String> {
        ["Rack", "Row", "Position", "PDU", "Cooling zone", "GPUs", "Retired"]
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.row.clone(),
            self.position.to_string(),
            self.pdu.to_string(),
            self.cooling_zone.to_string(),
            self.gpu_count.to_string(),
            self.retired.to_string(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        Self::table_headers().into_iter().zip(self.table_row()).collect()
    }
}

/// Merge a rack mapping CSV into `topology` and validate the result.
/// Returns the number of rows merged.
pub fn merge_csv(topology: &mut Topology, csv_path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(csv_path)
        .with_context(|| format!("Failed to read {}", csv_path.display()))?;
    let merged = topology
        .merge_rack_csv(&content)
        .with_context(|| format!("Failed to parse {}", csv_path.display()))?;
    topology
        .validate()
        .context("Merged topology is inconsistent")?;
    Ok(merged)
}

/// Import `csv_path` into the topology, writing the merged topology to
/// `write` when given
pub fn import_csv(
    mut topology: Topology,
    csv_path: &Path,
    write: Option<&Path>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let merged = merge_csv(&mut topology, csv_path)?;
    info!(rows = merged, racks = topology.racks.len(), "Rack CSV merged");

    if let Some(out) = write {
        std::fs::write(out, topology.to_yaml()?)
            .with_context(|| format!("Failed to write {}", out.display()))?;
    }

    formatter.print_list(&topology.racks)?;
    let target = write
        .map(|p| format!(", written to {}", p.display()))
        .unwrap_or_default();
    formatter.print_success(&format!("Merged {} rack row(s){}", merged, target))
}
