//! Core traits for uponline components
//!
//! A telemetry source is anything that can push normalized samples into the
//! ingestion pipeline: a collector bridge, a message bus consumer, or a replay
//! of recorded samples.

use crate::telemetry::TelemetrySample;
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Trait for producers of telemetry samples
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Human-readable name used in logs
    fn name(&self) -> &str;

    /// Push samples into `sender` until the source is exhausted, stopped, or
    /// the receiving side is dropped. Returns the number of samples sent.
    async fn start(&self, sender: mpsc::Sender<TelemetrySample>) -> Result<u64>;

    /// Ask a running source to stop at the next sample boundary
    async fn stop(&self) -> Result<()>;
}
