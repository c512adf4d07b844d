//! Change requests and their lifecycle

use crate::checks::CheckOutcome;
use crate::validator::Verdict;
use crate::{Result, ValidatorError};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use uponline_core::{ClusterId, RackId};
use uuid::Uuid;

/// Change request identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);

impl ChangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id of the form `CHG-1a2b3c4d`
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("CHG-{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChangeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    AddGpuNodes,
    MigrateWorkload,
    FirmwareUpdate,
    Decommission,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::AddGpuNodes => write!(f, "Add GPU Nodes"),
            ChangeType::MigrateWorkload => write!(f, "Migrate Workload"),
            ChangeType::FirmwareUpdate => write!(f, "Firmware Update"),
            ChangeType::Decommission => write!(f, "Decommission"),
        }
    }
}

/// Asset a change applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTarget {
    Rack(RackId),
    /// Every rack hosting the cluster's nodes; deltas are split evenly
    Cluster(ClusterId),
}

impl fmt::Display for ChangeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeTarget::Rack(id) => write!(f, "Rack {}", id),
            ChangeTarget::Cluster(name) => write!(f, "Cluster {}", name),
        }
    }
}

/// Declared load deltas in kW. Negative values release capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeDeltas {
    pub power_kw: f64,
    pub thermal_kw: f64,
}

impl ChangeDeltas {
    pub fn new(power_kw: f64, thermal_kw: f64) -> Self {
        Self { power_kw, thermal_kw }
    }

    pub fn split(&self, parts: usize) -> Self {
        let parts = parts.max(1) as f64;
        Self {
            power_kw: self.power_kw / parts,
            thermal_kw: self.thermal_kw / parts,
        }
    }

    pub fn negated(&self) -> Self {
        Self {
            power_kw: -self.power_kw,
            thermal_kw: -self.thermal_kw,
        }
    }
}

/// Half-open execution window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ScheduledWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(ValidatorError::InvalidRequest(format!(
                "window end {} is not after start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &ScheduledWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Same length, starting at `start`
    pub fn moved_to(&self, start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: start + self.duration(),
        }
    }

    /// UTC hours of day the window touches, in order, without repeats
    pub fn hours(&self) -> Vec<u32> {
        let mut hours = Vec::new();
        let mut cursor = self
            .start
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(self.start);
        while cursor < self.end && hours.len() < 24 {
            hours.push(cursor.hour());
            cursor += Duration::hours(1);
        }
        hours
    }
}

impl fmt::Display for ScheduledWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.format("%Y-%m-%d %H:%M UTC"),
            self.end.format("%Y-%m-%d %H:%M UTC")
        )
    }
}

/// A proposed change as submitted by a requester
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSpec {
    pub change_type: ChangeType,
    pub target: ChangeTarget,

    /// Rack the workload moves away from; receives the negated deltas
    #[serde(default)]
    pub source: Option<RackId>,

    #[serde(default)]
    pub deltas: ChangeDeltas,
    pub window: ScheduledWindow,
    pub requester: String,

    #[serde(default)]
    pub description: Option<String>,
}

impl ChangeSpec {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let spec: ChangeSpec = serde_yaml::from_str(content)
            .map_err(|e| ValidatorError::InvalidRequest(format!("invalid change document: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(uponline_core::Error::from)?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        ScheduledWindow::new(self.window.start, self.window.end)?;
        if !self.deltas.power_kw.is_finite() || !self.deltas.thermal_kw.is_finite() {
            return Err(ValidatorError::InvalidRequest(
                "deltas must be finite numbers".to_string(),
            ));
        }
        if self.requester.trim().is_empty() {
            return Err(ValidatorError::InvalidRequest("requester is required".to_string()));
        }
        if self.source.is_some() && self.change_type != ChangeType::MigrateWorkload {
            return Err(ValidatorError::InvalidRequest(format!(
                "a source rack only applies to {}",
                ChangeType::MigrateWorkload
            )));
        }
        Ok(())
    }
}

/// Overall outcome of one validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Overall {
    Pass,
    PassWithWarnings,
    Fail,
}

impl Overall {
    pub fn from_worst(worst: CheckOutcome) -> Self {
        match worst {
            CheckOutcome::Pass => Overall::Pass,
            CheckOutcome::Warning => Overall::PassWithWarnings,
            CheckOutcome::Fail => Overall::Fail,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Overall::Pass => "pass",
            Overall::PassWithWarnings => "pass_with_warnings",
            Overall::Fail => "fail",
        }
    }
}

impl fmt::Display for Overall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Overall::Pass => write!(f, "Pass"),
            Overall::PassWithWarnings => write!(f, "Pass with warnings"),
            Overall::Fail => write!(f, "Fail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeState {
    Draft,
    Validating,
    Validated(Overall),
    Approved,
    Blocked,
}

impl ChangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChangeState::Approved | ChangeState::Blocked)
    }

    /// Whether a request in this state holds its window against others
    pub fn reserves_window(&self) -> bool {
        matches!(
            self,
            ChangeState::Validated(Overall::Pass | Overall::PassWithWarnings) | ChangeState::Approved
        )
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeState::Draft => write!(f, "Draft"),
            ChangeState::Validating => write!(f, "Validating"),
            ChangeState::Validated(overall) => write!(f, "Validated ({})", overall),
            ChangeState::Approved => write!(f, "Approved"),
            ChangeState::Blocked => write!(f, "Blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ChangeState,
    pub to: ChangeState,
    pub at: DateTime<Utc>,
}

/// A change request with its lifecycle state and latest verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: ChangeId,
    pub spec: ChangeSpec,
    pub state: ChangeState,
    /// Verdict of the latest validation; cleared by a reschedule
    pub verdict: Option<Verdict>,
    /// Bumped on every committed modification
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<Transition>,
}

impl ChangeRequest {
    pub fn draft(id: ChangeId, spec: ChangeSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            state: ChangeState::Draft,
            verdict: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Copy of the request moved to `to`
    pub(crate) fn transitioned(&self, to: ChangeState) -> Self {
        let now = Utc::now();
        let mut next = self.clone();
        next.history.push(Transition {
            from: self.state,
            to,
            at: now,
        });
        next.state = to;
        next.updated_at = now;
        next
    }

    pub fn window(&self) -> &ScheduledWindow {
        &self.spec.window
    }
}
