//! Configuration commands

use crate::output::{OutputFormat, OutputFormatter};
use anyhow::{Context, Result};
use std::path::Path;
use uponline_core::EngineConfig;

/// Print the effective configuration after defaults, file and environment
pub fn show_config(config: &EngineConfig, formatter: &OutputFormatter) -> Result<()> {
    match formatter.format() {
        OutputFormat::Json => formatter.print_structured(config),
        OutputFormat::Yaml | OutputFormat::Table => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

/// Check a configuration file without loading anything else
pub fn validate_config(path: &Path, formatter: &OutputFormatter) -> Result<()> {
    EngineConfig::from_file(path)
        .with_context(|| format!("Invalid configuration: {}", path.display()))?;
    formatter.print_success(&format!("{} is valid", path.display()))
}
