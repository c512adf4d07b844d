//! A loaded engine: configuration, topology and replayed telemetry
//!
//! The CLI is a one-shot process. Each query command opens a session, which
//! builds the risk engine from the topology file, replays the telemetry file
//! (if any) through the ingestion pipeline and publishes a snapshot that
//! every read of the command binds to.

use crate::replay::JsonLinesSource;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uponline_core::{EngineConfig, Topology};
use uponline_state::{QueryEngine, RiskEngine, TelemetryPipeline};
use uponline_validator::ChangeValidator;

const DEFAULT_TOPOLOGY: &str = "./topology.yaml";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Load engine configuration from `path`, or from the layered defaults
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display())),
        None => EngineConfig::load().context("Failed to load configuration"),
    }
}

pub fn load_topology(path: Option<&Path>) -> Result<Topology> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(DEFAULT_TOPOLOGY));
    Topology::from_file(&path)
        .with_context(|| format!("Failed to load topology: {}", path.display()))
}

pub struct Session {
    engine: Arc<RiskEngine>,
    query: QueryEngine,
    replayed: u64,
}

impl Session {
    pub async fn open(
        config: EngineConfig,
        topology: Topology,
        telemetry: Option<&Path>,
    ) -> Result<Self> {
        let engine = Arc::new(RiskEngine::new(config, topology)?);

        let replayed = match telemetry {
            Some(path) => {
                let pipeline = TelemetryPipeline::start(engine.clone());
                let accepted = pipeline
                    .run_source(Arc::new(JsonLinesSource::new(path)))
                    .await?;
                if !pipeline.drain(DRAIN_TIMEOUT).await {
                    warn!("Telemetry queues did not drain within {:?}", DRAIN_TIMEOUT);
                }
                pipeline.shutdown().await;

                let stats = pipeline.stats();
                info!(
                    accepted,
                    rejected = stats.rejected.load(std::sync::atomic::Ordering::Relaxed),
                    "Telemetry replay complete"
                );
                accepted
            }
            None => {
                engine.publish();
                0
            }
        };

        let query = QueryEngine::new(engine.store().clone());
        Ok(Self {
            engine,
            query,
            replayed,
        })
    }

    pub fn engine(&self) -> &RiskEngine {
        &self.engine
    }

    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    /// Samples accepted from the telemetry file
    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    pub fn validator(&self) -> Result<ChangeValidator> {
        Ok(ChangeValidator::for_engine(&self.engine)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLOOR: &str = "../../fixtures/floor.yaml";
    const TELEMETRY: &str = "../../fixtures/telemetry.jsonl";

    #[tokio::test]
    async fn test_session_without_telemetry_publishes() {
        let topology = load_topology(Some(Path::new(FLOOR))).unwrap();
        let session = Session::open(EngineConfig::default(), topology, None).await.unwrap();
        assert_eq!(session.replayed(), 0);
        assert_eq!(session.query().list_racks().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_session_replays_fixture() {
        let topology = load_topology(Some(Path::new(FLOOR))).unwrap();
        let session = Session::open(EngineConfig::default(), topology, Some(Path::new(TELEMETRY)))
            .await
            .unwrap();
        assert!(session.replayed() > 0);

        let b3 = session.query().get_rack(&"B3".into()).unwrap();
        assert_eq!(b3.inlet_c, Some(38.4));
        assert_eq!(b3.risk_level, uponline_core::RiskLevel::High);
    }

    #[test]
    fn test_missing_topology_is_reported() {
        let err = load_topology(Some(Path::new("/nonexistent/topology.yaml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/topology.yaml"));
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "scoring:\n  thermal_ceiling_c: 40.0").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.scoring.thermal_ceiling_c, 40.0);
    }
}
