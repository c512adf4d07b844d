//! Prometheus metrics for the risk engine

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder};

use crate::{Result, StateError};

/// Engine metrics registered on a private registry
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    registry: Registry,

    /// Samples accepted by the normalizer and applied
    pub samples_accepted: IntCounter,

    /// Samples dropped, by error category
    pub samples_rejected: IntCounterVec,

    /// Latest risk score per rack
    pub rack_risk_score: IntGaugeVec,

    /// Version of the latest published snapshot
    pub snapshot_version: IntGauge,

    /// Version of the loaded topology
    pub topology_version: IntGauge,

    /// Change validations, by verdict
    pub validations: IntCounterVec,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let metrics = Self {
            registry: Registry::new(),
            samples_accepted: IntCounter::new(
                "uponline_samples_accepted_total",
                "Telemetry samples accepted",
            )?,
            samples_rejected: IntCounterVec::new(
                prometheus::Opts::new("uponline_samples_rejected_total", "Telemetry samples rejected"),
                &["reason"],
            )?,
            rack_risk_score: IntGaugeVec::new(
                prometheus::Opts::new("uponline_rack_risk_score", "Current rack risk score (0-100)"),
                &["rack"],
            )?,
            snapshot_version: IntGauge::new(
                "uponline_snapshot_version",
                "Version of the latest published snapshot",
            )?,
            topology_version: IntGauge::new(
                "uponline_topology_version",
                "Version of the loaded topology",
            )?,
            validations: IntCounterVec::new(
                prometheus::Opts::new("uponline_validations_total", "Change validations by verdict"),
                &["verdict"],
            )?,
        };
        metrics.register()?;
        Ok(metrics)
    }

    fn register(&self) -> prometheus::Result<()> {
        self.registry.register(Box::new(self.samples_accepted.clone()))?;
        self.registry.register(Box::new(self.samples_rejected.clone()))?;
        self.registry.register(Box::new(self.rack_risk_score.clone()))?;
        self.registry.register(Box::new(self.snapshot_version.clone()))?;
        self.registry.register(Box::new(self.topology_version.clone()))?;
        self.registry.register(Box::new(self.validations.clone()))?;
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_rejection(&self, reason: &str) {
        self.samples_rejected.with_label_values(&[reason]).inc();
    }

    pub fn record_validation(&self, verdict: &str) {
        self.validations.with_label_values(&[verdict]).inc();
    }

    /// Export all metrics in the Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| StateError::Metrics(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| StateError::Metrics(format!("metrics are not valid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_export() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.samples_accepted.inc();
        metrics.record_rejection("unknown_entity");
        metrics.rack_risk_score.with_label_values(&["B3"]).set(82);
        metrics.record_validation("Pass");

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("uponline_samples_accepted_total 1"));
        assert!(text.contains("uponline_samples_rejected_total{reason=\"unknown_entity\"} 1"));
        assert!(text.contains("uponline_rack_risk_score{rack=\"B3\"} 82"));
        assert!(text.contains("uponline_validations_total{verdict=\"Pass\"} 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = EngineMetrics::new().unwrap();
        let b = EngineMetrics::new().unwrap();
        a.samples_accepted.inc();
        assert_eq!(b.samples_accepted.get(), 0);
    }
}
