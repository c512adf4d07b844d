//! # uponline-validator
//!
//! Pre-flight validation of proposed infrastructure changes.
//!
//! A change request declares a target (rack or cluster), power and thermal
//! deltas, and an execution window. Validation runs an ordered pipeline of
//! constraint checks against one pinned snapshot of the risk engine:
//!
//! 1. Power headroom on the target PDU
//! 2. Cooling capacity of the target zone
//! 3. N+1 power and cooling redundancy
//! 4. Scheduling conflicts with other reserved changes
//! 5. Exposure of running training jobs
//!
//! The verdict also carries an advisory what-if projection and, when a
//! load-bound check does not pass, a suggested lower-load window.

use thiserror::Error;

pub mod change;
pub mod checks;
pub mod registry;
pub mod simulate;
pub mod validator;
pub mod window;

// Re-export commonly used types
pub use change::{
    ChangeDeltas, ChangeId, ChangeRequest, ChangeSpec, ChangeState, ChangeTarget, ChangeType,
    Overall, ScheduledWindow,
};
pub use checks::{CheckContext, CheckKind, CheckOutcome, CheckResult, ConstraintCheck, RackImpact};
pub use registry::{ChangeRegistry, ScheduleView};
pub use simulate::{RackProjection, Simulation, Simulator};
pub use validator::{ChangeValidator, ValidatorMetrics, Verdict};
pub use window::{WindowScan, WindowScanner, WindowSuggestion};

/// Result type for validator operations
pub type Result<T> = std::result::Result<T, ValidatorError>;

/// Errors that can occur during change validation
#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("Insufficient topology for {check}: {detail}")]
    InsufficientTopology { check: String, detail: String },

    #[error("Cannot {action} change {id} in state {from}")]
    InvalidTransition {
        id: String,
        from: String,
        action: String,
    },

    #[error("Invalid change request: {0}")]
    InvalidRequest(String),

    #[error("Concurrent modification of change {0}")]
    ConcurrentModification(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State error: {0}")]
    State(#[from] uponline_state::StateError),

    #[error("Core error: {0}")]
    Core(#[from] uponline_core::Error),
}

impl ValidatorError {
    pub fn invalid_transition(id: &ChangeId, from: ChangeState, action: &str) -> Self {
        Self::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            action: action.to_string(),
        }
    }

    /// Lost a race; the operation can be repeated against the latest state
    pub fn is_retryable(&self) -> bool {
        match self {
            ValidatorError::ConcurrentModification(_) => true,
            ValidatorError::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}
