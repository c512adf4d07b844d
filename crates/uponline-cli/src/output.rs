//! Output formatting for the uponline CLI

use anyhow::Result;
use clap::ValueEnum;
use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use serde::Serialize;
use uponline_core::{Readiness, RiskLevel, RiskSeverity};
use uponline_validator::{CheckOutcome, Overall};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Types that can be rendered as table rows or key/value detail
pub trait Formattable {
    fn table_headers() -> Vec<String>;
    fn table_row(&self) -> Vec<String>;

    /// Key/value pairs for the detailed view
    fn key_value_pairs(&self) -> Vec<(String, String)>;
}

/// Output formatter
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_structured(&self) -> bool {
        self.format != OutputFormat::Table
    }

    /// Print any serializable value in a structured format. Table output is
    /// left to the caller.
    pub fn print_structured<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
            OutputFormat::Table => {}
        }
        Ok(())
    }

    /// Format and print a single item
    pub fn print_item<T>(&self, item: &T) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        if self.is_structured() {
            return self.print_structured(item);
        }
        for (key, value) in item.key_value_pairs() {
            println!("{}: {}", key.bold().cyan(), value);
        }
        Ok(())
    }

    /// Format and print a list of items
    pub fn print_list<T>(&self, items: &[T]) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        if self.is_structured() {
            return self.print_structured(items);
        }
        if items.is_empty() {
            println!("{}", "No items found".dimmed());
            return Ok(());
        }
        println!("{}", render_table(items));
        Ok(())
    }

    /// Print a titled section header (table output only)
    pub fn print_heading(&self, title: &str) {
        if !self.is_structured() {
            println!("\n{}", title.bold().underline());
        }
    }

    pub fn print_success(&self, message: &str) -> Result<()> {
        self.print_status("success", message, |m| format!("{} {}", "✓".green().bold(), m.green()))
    }

    pub fn print_warning(&self, message: &str) -> Result<()> {
        self.print_status("warning", message, |m| format!("{} {}", "⚠".yellow().bold(), m.yellow()))
    }

    pub fn print_info(&self, message: &str) -> Result<()> {
        self.print_status("info", message, |m| format!("{} {}", "ℹ".blue().bold(), m.blue()))
    }

    fn print_status(&self, status: &str, message: &str, styled: impl FnOnce(&str) -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let result = serde_json::json!({ "status": status, "message": message });
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            OutputFormat::Yaml => {
                println!("status: {}", status);
                println!("message: {}", message);
            }
            OutputFormat::Table => println!("{}", styled(message)),
        }
        Ok(())
    }

    /// Print ordered key/value statistics
    pub fn print_stats(&self, stats: &[(String, String)]) -> Result<()> {
        if self.is_structured() {
            let map: serde_json::Map<String, serde_json::Value> = stats
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            return self.print_structured(&map);
        }

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![header_cell("Metric"), header_cell("Value")]);
        for (key, value) in stats {
            table.add_row(vec![key, value]);
        }
        println!("{}", table);
        Ok(())
    }
}

fn header_cell(title: &str) -> Cell {
    Cell::new(title).add_attribute(Attribute::Bold).fg(Color::Cyan)
}

/// Build a table for `items`
pub fn render_table<T: Formattable>(items: &[T]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(T::table_headers().iter().map(|h| header_cell(h)).collect::<Vec<_>>());
    for item in items {
        table.add_row(item.table_row());
    }
    table
}

/// `12.3` with one decimal, or `-` when absent
pub fn format_optional(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1}{}", v, unit),
        None => "-".to_string(),
    }
}

pub fn format_percentage(value: Option<f64>) -> String {
    format_optional(value, "%")
}

pub fn colorize_level(level: RiskLevel) -> ColoredString {
    let text = level.to_string();
    match level {
        RiskLevel::High => text.red().bold(),
        RiskLevel::Medium => text.yellow(),
        RiskLevel::Low => text.normal(),
        RiskLevel::None => text.dimmed(),
    }
}

pub fn colorize_severity(severity: RiskSeverity) -> ColoredString {
    let text = severity.to_string();
    match severity {
        RiskSeverity::Critical => text.red().bold(),
        RiskSeverity::Warning => text.yellow(),
        RiskSeverity::Info => text.blue(),
    }
}

pub fn colorize_readiness(readiness: Readiness) -> ColoredString {
    let text = readiness.to_string();
    match readiness {
        Readiness::Ready => text.green(),
        Readiness::Degraded => text.yellow(),
        Readiness::NotReady => text.red().bold(),
    }
}

pub fn colorize_outcome(outcome: CheckOutcome) -> ColoredString {
    let text = format!("{:?}", outcome);
    match outcome {
        CheckOutcome::Pass => text.green(),
        CheckOutcome::Warning => text.yellow(),
        CheckOutcome::Fail => text.red().bold(),
    }
}

pub fn colorize_overall(overall: Overall) -> ColoredString {
    match overall {
        Overall::Pass => "PASS".green().bold(),
        Overall::PassWithWarnings => "PASS WITH WARNINGS".yellow().bold(),
        Overall::Fail => "FAIL".red().bold(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct TestItem {
        name: String,
        score: u8,
    }

    impl Formattable for TestItem {
        fn table_headers() -> Vec<String> {
            vec!["Name".to_string(), "Score".to_string()]
        }

        fn table_row(&self) -> Vec<String> {
            vec![self.name.clone(), self.score.to_string()]
        }

        fn key_value_pairs(&self) -> Vec<(String, String)> {
            vec![
                ("Name".to_string(), self.name.clone()),
                ("Score".to_string(), self.score.to_string()),
            ]
        }
    }

    #[test]
    fn test_output_format_default() {
        assert_eq!(OutputFormat::default(), OutputFormat::Table);
        assert!(!OutputFormatter::new(OutputFormat::Table).is_structured());
        assert!(OutputFormatter::new(OutputFormat::Yaml).is_structured());
    }

    #[test]
    fn test_render_table() {
        let items = vec![
            TestItem { name: "A1".to_string(), score: 12 },
            TestItem { name: "B3".to_string(), score: 82 },
        ];
        let rendered = render_table(&items).to_string();
        assert!(rendered.contains("Score"));
        assert!(rendered.contains("B3"));
        assert!(rendered.contains("82"));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_percentage(Some(24.5)), "24.5%");
        assert_eq!(format_percentage(None), "-");
        assert_eq!(format_optional(Some(38.44), " °C"), "38.4 °C");
    }
}
