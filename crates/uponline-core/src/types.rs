//! Core type definitions for uponline

use crate::config::RiskBuckets;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Rack identifier (e.g. "B3")
    RackId
);
string_id!(
    /// Cooling zone name (e.g. "Zone B")
    ZoneId
);
string_id!(
    /// CRAH unit name (e.g. "CRAH-4")
    CrahId
);
string_id!(
    /// Power domain identifier: utility feed, ATS, UPS or PDU
    PowerDomainId
);
string_id!(
    /// GPU cluster name (e.g. "train-cluster-beta")
    ClusterId
);
string_id!(
    /// GPU node hostname (e.g. "beta-node-07")
    NodeId
);
string_id!(
    /// Training job name (e.g. "llm-pretrain-7b-run-042")
    JobId
);

/// Categorical infrastructure risk attributed to racks and training jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Bucket a 0-100 risk score
    pub fn from_score(score: u8, buckets: &RiskBuckets) -> Self {
        if score >= buckets.high {
            RiskLevel::High
        } else if score >= buckets.medium {
            RiskLevel::Medium
        } else if score >= buckets.low {
            RiskLevel::Low
        } else {
            RiskLevel::None
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::None => write!(f, "None"),
            RiskLevel::Low => write!(f, "Low"),
            RiskLevel::Medium => write!(f, "Medium"),
            RiskLevel::High => write!(f, "High"),
        }
    }
}

/// Severity of an entry in the active risk list
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskSeverity {
    Info,
    Warning,
    Critical,
}

impl std::str::FromStr for RiskSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(RiskSeverity::Info),
            "warning" | "warn" => Ok(RiskSeverity::Warning),
            "critical" => Ok(RiskSeverity::Critical),
            _ => Err(format!("Unknown risk severity: {}", s)),
        }
    }
}

impl fmt::Display for RiskSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskSeverity::Info => write!(f, "Info"),
            RiskSeverity::Warning => write!(f, "Warning"),
            RiskSeverity::Critical => write!(f, "Critical"),
        }
    }
}

/// Health status of a GPU node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeHealth {
    Healthy,
    Warning,
    Critical,
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeHealth::Healthy => write!(f, "Healthy"),
            NodeHealth::Warning => write!(f, "Warning"),
            NodeHealth::Critical => write!(f, "Critical"),
        }
    }
}

/// Readiness of a GPU cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Readiness {
    Ready,
    Degraded,
    NotReady,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "Ready"),
            Readiness::Degraded => write!(f, "Degraded"),
            Readiness::NotReady => write!(f, "Not Ready"),
        }
    }
}

/// Status of a training job. `AtRisk` is derived, never declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Queued,
    AtRisk,
}

impl JobStatus {
    /// Running jobs, including those flagged at risk
    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::AtRisk)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Queued => write!(f, "Queued"),
            JobStatus::AtRisk => write!(f, "At Risk"),
        }
    }
}

/// Direction of a rack's risk score relative to its previous score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    pub fn between(previous: u8, current: u8, epsilon: u8) -> Self {
        if current > previous.saturating_add(epsilon) {
            Trend::Up
        } else if current.saturating_add(epsilon) < previous {
            Trend::Down
        } else {
            Trend::Stable
        }
    }
}

/// Operational status of a CRAH unit or power equipment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UnitStatus {
    #[default]
    Online,
    Degraded,
    Offline,
}

/// Level of a node in the power delivery tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerDomainKind {
    Utility,
    Ats,
    Ups,
    Pdu,
}

impl fmt::Display for PowerDomainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerDomainKind::Utility => write!(f, "utility"),
            PowerDomainKind::Ats => write!(f, "ats"),
            PowerDomainKind::Ups => write!(f, "ups"),
            PowerDomainKind::Pdu => write!(f, "pdu"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_and_conversion() {
        let rack = RackId::from("B3");
        assert_eq!(rack.to_string(), "B3");
        assert_eq!(rack.as_str(), "B3");
        assert_eq!(RackId::new(String::from("B3")), rack);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&JobId::new("llm-pretrain-7b-run-042")).unwrap();
        assert_eq!(json, "\"llm-pretrain-7b-run-042\"");
    }

    #[test]
    fn test_risk_level_buckets() {
        let buckets = RiskBuckets::default();
        assert_eq!(RiskLevel::from_score(82, &buckets), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(60, &buckets), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(59, &buckets), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(30, &buckets), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(10, &buckets), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(9, &buckets), RiskLevel::None);
        assert!(RiskLevel::High > RiskLevel::Medium);
    }

    #[test]
    fn test_severity_parsing() {
        assert_eq!("warning".parse::<RiskSeverity>().unwrap(), RiskSeverity::Warning);
        assert_eq!("CRITICAL".parse::<RiskSeverity>().unwrap(), RiskSeverity::Critical);
        assert!("severe".parse::<RiskSeverity>().is_err());
        assert!(RiskSeverity::Critical > RiskSeverity::Info);
    }

    #[test]
    fn test_trend() {
        assert_eq!(Trend::between(30, 40, 2), Trend::Up);
        assert_eq!(Trend::between(40, 30, 2), Trend::Down);
        assert_eq!(Trend::between(40, 41, 2), Trend::Stable);
    }

    #[test]
    fn test_job_status_running() {
        assert!(JobStatus::Running.is_running());
        assert!(JobStatus::AtRisk.is_running());
        assert!(!JobStatus::Queued.is_running());
        assert_eq!(Readiness::NotReady.to_string(), "Not Ready");
    }
}
