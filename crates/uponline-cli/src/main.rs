//! uponline CLI
//!
//! Loads the facility topology, replays recorded telemetry through the risk
//! engine and answers operator questions: which racks and jobs are at risk,
//! how healthy each cluster is, and whether a planned change is safe.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::debug;
use uponline_core::config::LoggingConfig;
use uponline_core::{ClusterId, JobStatus, RiskLevel, RiskSeverity};
use uponline_state::JobFilter;
use uponline_validator::Overall;

mod commands;
mod output;
mod replay;
mod session;

use output::{OutputFormat, OutputFormatter};
use session::Session;

/// GPU data-center risk scoring and change validation
#[derive(Debug, Parser)]
#[command(name = "uponline")]
#[command(about = "Risk scoring and change validation for GPU data centers")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (defaults to UPONLINE_CONFIG or ./uponline.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Facility topology file
    #[arg(short, long, global = true)]
    pub topology: Option<PathBuf>,

    /// JSON-lines telemetry to replay before answering
    #[arg(long, global = true)]
    pub telemetry: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    pub output: OutputFormat,

    /// Log level filter; RUST_LOG takes precedence
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the active risk list and fleet summary
    Risks {
        /// Minimum severity to include
        #[arg(long, value_enum, default_value_t = SeverityArg::Info)]
        min_severity: SeverityArg,
    },

    /// List racks with their risk scores
    Racks {
        /// Sort by risk score, worst first
        #[arg(long)]
        by_score: bool,

        /// Include cooling zone and power domain rollups
        #[arg(short, long)]
        detailed: bool,
    },

    /// List training jobs, worst slowdown first
    Jobs {
        #[arg(long)]
        cluster: Option<String>,

        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Only jobs at or above this infrastructure risk
        #[arg(long, value_enum)]
        min_risk: Option<LevelArg>,
    },

    /// Describe one training job and the chain behind its risk
    Job {
        name: String,
    },

    /// Show GPU cluster health
    Clusters,

    /// Validate a change request document
    Validate {
        /// Change request YAML
        change: PathBuf,

        /// Approve the change if it does not fail
        #[arg(long)]
        approve: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Merge a rack mapping CSV into the topology
    ImportCsv {
        /// CSV with rack_id,row,position,pdu,cooling_zone,gpu_count
        file: PathBuf,

        /// Write the merged topology here
        #[arg(short, long)]
        write: Option<PathBuf>,
    },

    /// Print engine metrics in Prometheus text format
    Metrics,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Validate a configuration file
    Validate {
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SeverityArg {
    Info,
    Warning,
    Critical,
}

impl From<SeverityArg> for RiskSeverity {
    fn from(arg: SeverityArg) -> Self {
        match arg {
            SeverityArg::Info => RiskSeverity::Info,
            SeverityArg::Warning => RiskSeverity::Warning,
            SeverityArg::Critical => RiskSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Running,
    Queued,
    AtRisk,
}

impl From<StatusArg> for JobStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Running => JobStatus::Running,
            StatusArg::Queued => JobStatus::Queued,
            StatusArg::AtRisk => JobStatus::AtRisk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LevelArg {
    Low,
    Medium,
    High,
}

impl From<LevelArg> for RiskLevel {
    fn from(arg: LevelArg) -> Self {
        match arg {
            LevelArg::Low => RiskLevel::Low,
            LevelArg::Medium => RiskLevel::Medium,
            LevelArg::High => RiskLevel::High,
        }
    }
}

/// Initialize logging on stderr so structured output stays parseable
fn init_logging(logging_config: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&logging_config.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    match logging_config.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = session::load_config(cli.config.as_deref())?;
    init_logging(&config.logging, cli.log_level.as_deref());
    debug!("Starting uponline CLI with {:?}", cli);

    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Config { action } => match action {
            ConfigCommands::Show => commands::config::show_config(&config, &formatter)?,
            ConfigCommands::Validate { file } => {
                commands::config::validate_config(&file, &formatter)?
            }
        },

        Commands::ImportCsv { file, write } => {
            let topology = session::load_topology(cli.topology.as_deref())?;
            commands::import::import_csv(topology, &file, write.as_deref(), &formatter)?;
        }

        command => {
            let topology = session::load_topology(cli.topology.as_deref())?;
            let session = Session::open(config, topology, cli.telemetry.as_deref()).await?;
            run_query(command, &session, &formatter)?;
        }
    }

    Ok(())
}

/// Commands that read from a loaded engine
fn run_query(command: Commands, session: &Session, formatter: &OutputFormatter) -> Result<()> {
    match command {
        Commands::Risks { min_severity } => {
            commands::risks::show_risks(session, min_severity.into(), formatter)?
        }
        Commands::Racks { by_score, detailed } => {
            commands::racks::list_racks(session, by_score, detailed, formatter)?
        }
        Commands::Jobs {
            cluster,
            status,
            min_risk,
        } => {
            let filter = JobFilter {
                cluster: cluster.map(ClusterId::new),
                status: status.map(Into::into),
                min_infra_risk: min_risk.map(Into::into),
            };
            commands::jobs::list_jobs(session, &filter, formatter)?
        }
        Commands::Job { name } => commands::jobs::describe_job(session, &name, formatter)?,
        Commands::Clusters => commands::clusters::list_clusters(session, formatter)?,
        Commands::Validate { change, approve } => {
            let verdict = commands::validate::validate_change(session, &change, approve, formatter)?;
            if verdict.overall == Overall::Fail {
                std::process::exit(2);
            }
        }
        Commands::Metrics => print!("{}", session.engine().metrics().gather_text()?),
        // handled in main before an engine is loaded
        Commands::Config { .. } | Commands::ImportCsv { .. } => {}
    }
    Ok(())
}
