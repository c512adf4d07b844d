//! Rack, cooling zone and power domain listings

use crate::output::{colorize_level, format_optional, format_percentage, Formattable, OutputFormatter};
use crate::session::Session;
use anyhow::Result;
use serde::Serialize;
use uponline_state::snapshot::{PowerDomainView, RackView, ZoneView};

impl Formattable for RackView {
    fn table_headers() -> Vec<String> {
        ["Rack", "Zone", "PDU", "Inlet", "Power", "Margin", "Score", "Level", "Trend", "Driver"]
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    fn table_row(&self) -> Vec<String> {
        let driver = match (&self.breakdown, self.stale) {
            (_, true) => "stale".to_string(),
            (Some(b), false) => format!("{:?}", b.dominant).to_lowercase(),
            (None, false) => "-".to_string(),
        };
        vec![
            self.id.to_string(),
            self.cooling_zone.to_string(),
            self.pdu.to_string(),
            format_optional(self.inlet_c, " °C"),
            match self.power_kw {
                Some(kw) => format!("{:.1}/{:.0} kW", kw, self.pdu_capacity_kw),
                None => "-".to_string(),
            },
            format_percentage(self.thermal_margin_pct),
            self.risk_score.to_string(),
            self.risk_level.to_string(),
            format!("{:?}", self.trend),
            driver,
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("Rack".to_string(), self.id.to_string()),
            ("Cooling zone".to_string(), self.cooling_zone.to_string()),
            ("PDU".to_string(), self.pdu.to_string()),
            ("Inlet".to_string(), format_optional(self.inlet_c, " °C")),
            ("Power".to_string(), format_optional(self.power_kw, " kW")),
            ("Thermal margin".to_string(), format_percentage(self.thermal_margin_pct)),
            ("Risk score".to_string(), self.risk_score.to_string()),
            ("Risk level".to_string(), colorize_level(self.risk_level).to_string()),
            ("Stale".to_string(), self.stale.to_string()),
        ]
    }
}

impl Formattable for ZoneView {
    fn table_headers() -> Vec<String> {
        ["Zone", "Racks", "CRAH units", "Capacity", "Heat load", "Margin", "Worst unit", "Score"]
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.name.to_string(),
            self.racks.len().to_string(),
            self.crah_units.len().to_string(),
            format!("{:.1} kW", self.effective_capacity_kw),
            format!("{:.1} kW", self.heat_load_kw),
            format_percentage(self.margin_pct),
            self.worst_unit
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string()),
            self.risk_score.to_string(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("Zone".to_string(), self.name.to_string()),
            ("Effective capacity".to_string(), format!("{:.1} kW", self.effective_capacity_kw)),
            ("Heat load".to_string(), format!("{:.1} kW", self.heat_load_kw)),
            ("Margin".to_string(), format_percentage(self.margin_pct)),
        ]
    }
}

impl Formattable for PowerDomainView {
    fn table_headers() -> Vec<String> {
        ["Domain", "Kind", "Parent", "Rated", "Load", "Headroom", "N+1 capacity"]
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.kind.to_string(),
            self.parent
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string()),
            format!("{:.0} kW", self.rated_capacity_kw),
            format!("{:.1} kW", self.load_kw),
            format!("{:.1}%", self.headroom_pct),
            format_optional(self.n_plus_one_capacity_kw(), " kW"),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("Domain".to_string(), self.id.to_string()),
            ("Load".to_string(), format!("{:.1} kW", self.load_kw)),
            ("Headroom".to_string(), format!("{:.1}%", self.headroom_pct)),
        ]
    }
}

#[derive(Debug, Serialize)]
struct FacilityReport {
    racks: Vec<RackView>,
    zones: Vec<ZoneView>,
    power_domains: Vec<PowerDomainView>,
}

/// List racks, worst first when `by_score` is set. `detailed` adds the
/// cooling zone and power domain rollups.
pub fn list_racks(
    session: &Session,
    by_score: bool,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let snapshot = session.query().pinned()?;
    let mut racks: Vec<RackView> = snapshot.racks.values().cloned().collect();
    if by_score {
        racks.sort_by(|a, b| b.risk_score.cmp(&a.risk_score).then_with(|| a.id.cmp(&b.id)));
    }

    if !detailed {
        return formatter.print_list(&racks);
    }

    let zones: Vec<ZoneView> = snapshot.zones.values().cloned().collect();
    let power_domains: Vec<PowerDomainView> = snapshot.power_domains.values().cloned().collect();
    if formatter.is_structured() {
        return formatter.print_structured(&FacilityReport {
            racks,
            zones,
            power_domains,
        });
    }

    formatter.print_list(&racks)?;
    formatter.print_heading("Cooling zones");
    formatter.print_list(&zones)?;
    formatter.print_heading("Power domains");
    formatter.print_list(&power_domains)
}
