//! # uponline-core
//!
//! Core types, topology model, and utilities for uponline - a risk scoring
//! and change validation engine for GPU data center infrastructure.
//!
//! This crate provides the foundational data structures shared by the other
//! uponline crates:
//!
//! - Identifiers and domain enums (risk levels, health, readiness)
//! - The topology model and its YAML/JSON/CSV loaders
//! - Telemetry samples and the normalizer
//! - Engine configuration with every scoring and validation threshold
//! - The unified error taxonomy

pub mod config;
pub mod error;
pub mod telemetry;
pub mod topology;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::EngineConfig;
pub use error::{Error, ErrorContext, Result};
pub use telemetry::{EntityKind, EntityRef, MetricKind, Normalizer, Reading, TelemetrySample};
pub use topology::Topology;
pub use traits::TelemetrySource;
pub use types::{
    ClusterId, CrahId, JobId, JobStatus, NodeHealth, NodeId, PowerDomainId, PowerDomainKind,
    RackId, Readiness, RiskLevel, RiskSeverity, Trend, UnitStatus, ZoneId,
};
