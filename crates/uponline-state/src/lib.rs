//! # uponline-state
//!
//! Live risk state for the uponline engine.
//!
//! This crate provides:
//! - Rack risk scoring from thermal margin, power headroom and load volatility
//! - GPU node health assessment and cluster readiness aggregation
//! - Job dependency graph and infrastructure risk propagation
//! - Versioned, immutable snapshots with optional persistence
//! - Read-only query API over published snapshots
//! - Async ingestion pipeline with per-entity queues and backpressure
//!
//! ## Example
//!
//! ```rust
//! use uponline_core::{EngineConfig, MetricKind, TelemetrySample, Topology};
//! use uponline_state::{QueryEngine, RiskEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let topology = Topology::from_yaml_str(r#"
//! racks:
//!   - { id: B3, row: B, position: 3, cooling_zone: Zone B, pdu: PDU-B3 }
//! cooling_zones:
//!   - name: Zone B
//!     crah_units: [{ name: CRAH-3, rated_capacity_kw: 45.0, setpoint_c: 22.0 }]
//! power_domains:
//!   - { id: PDU-B3, kind: Pdu, rated_capacity_kw: 20.0 }
//! "#)?;
//! let engine = RiskEngine::new(EngineConfig::default(), topology)?;
//! engine.apply_sample(&TelemetrySample::new(
//!     "B3",
//!     MetricKind::InletTemperature,
//!     38.4,
//!     chrono::Utc::now(),
//! ))?;
//! engine.publish();
//!
//! let query = QueryEngine::new(engine.store().clone());
//! println!("B3 risk: {}", query.get_rack(&"B3".into())?.risk_score);
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod engine;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod propagation;
pub mod query;
pub mod risks;
pub mod scoring;
pub mod snapshot;
pub mod store;

// Re-export commonly used types
pub use engine::{RiskEngine, SampleOutcome};
pub use health::{ClusterHealth, NodeAssessment};
pub use metrics::EngineMetrics;
pub use pipeline::{PipelineStats, TelemetryPipeline};
pub use propagation::{DependencyGraph, JobRisk, RiskTrace};
pub use query::{JobFilter, QueryEngine, QueryStats};
pub use scoring::{RackScorer, ScoreBreakdown, ScoreFactor};
pub use snapshot::{
    ActiveRisk, ClusterView, FleetSummary, JobView, NodeView, PowerDomainView, RackView,
    RiskKind, Snapshot, ZoneView,
};
pub use store::{FileBackend, MemoryBackend, SnapshotBackend, SnapshotStore};

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur during state operations
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Dependency graph error: {0}")]
    Graph(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No snapshot has been published yet")]
    NoSnapshot,

    #[error("Telemetry queue for {entity} is full")]
    Backpressure { entity: String },

    #[error("Telemetry pipeline is shut down")]
    PipelineClosed,

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] uponline_core::Error),
}

impl StateError {
    /// Whether the error came from a rejected telemetry sample
    pub fn is_rejected_sample(&self) -> bool {
        matches!(self, StateError::Core(e) if e.is_ingest_error())
    }
}
