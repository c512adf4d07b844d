//! Error handling for uponline
//!
//! Provides the error taxonomy shared by every engine component. Ingestion
//! errors (`InvalidSample`, `UnknownEntity`) are recovered locally by dropping
//! the sample; `ConcurrentModification` is the only retryable variant.

/// Result type alias for uponline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for uponline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-range telemetry
    #[error("Invalid sample for {entity} ({metric}): {reason}")]
    InvalidSample {
        entity: String,
        metric: String,
        reason: String,
    },

    /// Sample or request references an asset not present in the topology
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    /// Entity has not reported within the staleness threshold
    #[error("Stale data for {entity}: last sample {age_secs}s ago")]
    StaleData { entity: String, age_secs: i64 },

    /// Two writers raced on the same job or change request
    #[error("Concurrent modification of {0}")]
    ConcurrentModification(String),

    /// Topology document failed validation
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// CSV parsing errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration source errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an invalid sample error
    pub fn invalid_sample(
        entity: impl Into<String>,
        metric: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidSample {
            entity: entity.into(),
            metric: metric.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown entity error
    pub fn unknown_entity(entity: impl Into<String>) -> Self {
        Self::UnknownEntity(entity.into())
    }

    /// Create a concurrent modification error
    pub fn concurrent_modification(what: impl Into<String>) -> Self {
        Self::ConcurrentModification(what.into())
    }

    /// Create an invalid topology error
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::InvalidTopology(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Check if this error is retryable against a fresher snapshot
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentModification(_))
    }

    /// Check if this error was raised by the ingestion layer and is
    /// recovered by dropping the offending sample
    pub fn is_ingest_error(&self) -> bool {
        matches!(self, Error::InvalidSample { .. } | Error::UnknownEntity(_))
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidSample { .. } => "invalid_sample",
            Error::UnknownEntity(_) => "unknown_entity",
            Error::StaleData { .. } => "stale_data",
            Error::ConcurrentModification(_) => "concurrent_modification",
            Error::InvalidTopology(_) => "topology",
            Error::InvalidConfiguration(_) => "configuration",
            Error::NotFound(_) => "not_found",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Csv(_) => "csv",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

/// Extension trait for adding context to Results
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", context.into(), original_error))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::invalid_sample("B3", "inlet_temperature", "value is NaN");
        assert!(matches!(err, Error::InvalidSample { .. }));
        assert_eq!(
            err.to_string(),
            "Invalid sample for B3 (inlet_temperature): value is NaN"
        );
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::unknown_entity("Z9").category(), "unknown_entity");
        assert_eq!(Error::config("bad").category(), "configuration");
        assert_eq!(Error::topology("cycle").category(), "topology");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::concurrent_modification("job-1").is_retryable());
        assert!(!Error::unknown_entity("Z9").is_retryable());

        assert!(Error::unknown_entity("Z9").is_ingest_error());
        assert!(Error::invalid_sample("A1", "power_draw", "negative").is_ingest_error());
        assert!(!Error::not_found("CHG-1").is_ingest_error());
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        let err = result.with_context("failed to read topology").unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(err.to_string().contains("failed to read topology"));
        assert!(err.to_string().contains("file not found"));
    }
}
