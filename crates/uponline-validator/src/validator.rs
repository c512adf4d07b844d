//! Change validation service
//!
//! `submit` registers a request and validates it in one call. Validation
//! pins the latest published snapshot and the current schedule view, runs
//! the check pipeline, projects the change, and looks for a safer window
//! when a load-bound check did not pass. The verdict is committed only if
//! the request and the set of reserved windows are unchanged since they were
//! read; otherwise the evaluation is repeated against the latest views.

use crate::change::{ChangeId, ChangeRequest, ChangeSpec, ChangeState, Overall, ScheduledWindow};
use crate::checks::{
    default_pipeline, resolve_impacts, CheckContext, CheckKind, CheckOutcome, CheckResult,
    ConstraintCheck,
};
use crate::registry::{ChangeRegistry, CommitGuard, ScheduleView};
use crate::simulate::{Simulation, Simulator};
use crate::window::{load_factor, WindowScan, WindowScanner};
use crate::{Result, ValidatorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uponline_core::config::{EngineConfig, ValidatorConfig};
use uponline_state::{EngineMetrics, RackScorer, RiskEngine, Snapshot, SnapshotStore, StateError};
use uuid::Uuid;

/// Outcome of one validation of one change request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub evaluation_id: Uuid,
    pub change_id: ChangeId,
    pub overall: Overall,
    /// In pipeline order
    pub checks: Vec<CheckResult>,
    pub simulation: Simulation,
    /// Present when a load-bound check did not pass
    pub window_scan: Option<WindowScan>,
    /// Simulation or window scan stopped at the time budget
    pub partial: bool,
    /// Baseline load factor of the requested window
    pub load_factor: f64,
    pub snapshot_version: u64,
    pub schedule_version: u64,
    pub evaluated_at: DateTime<Utc>,
}

impl Verdict {
    pub fn check(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.check == kind)
    }

    /// Checks that did not pass
    pub fn findings(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.outcome != CheckOutcome::Pass)
    }

    pub fn suggested_window(&self) -> Option<&ScheduledWindow> {
        self.window_scan
            .as_ref()
            .and_then(|s| s.suggestion.as_ref())
            .map(|s| &s.window)
    }
}

/// Validator statistics
#[derive(Debug, Default)]
pub struct ValidatorMetrics {
    pub submitted: AtomicU64,
    pub validations: AtomicU64,
    pub passed: AtomicU64,
    pub passed_with_warnings: AtomicU64,
    pub failed: AtomicU64,
    pub insufficient_topology: AtomicU64,
    pub commit_retries: AtomicU64,
    pub partial_results: AtomicU64,
    pub windows_suggested: AtomicU64,
}

impl ValidatorMetrics {
    fn record(&self, verdict: &Verdict) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        let counter = match verdict.overall {
            Overall::Pass => &self.passed,
            Overall::PassWithWarnings => &self.passed_with_warnings,
            Overall::Fail => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if verdict.partial {
            self.partial_results.fetch_add(1, Ordering::Relaxed);
        }
        if verdict.suggested_window().is_some() {
            self.windows_suggested.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
pub struct ChangeValidator {
    config: ValidatorConfig,
    checks: Vec<Arc<dyn ConstraintCheck>>,
    simulator: Simulator,
    scanner: WindowScanner,
    registry: Arc<ChangeRegistry>,
    store: Arc<SnapshotStore>,
    engine_metrics: Option<Arc<EngineMetrics>>,
    metrics: ValidatorMetrics,
}

fn scanner_for(checks: &[Arc<dyn ConstraintCheck>], lookahead_hours: u32) -> WindowScanner {
    let relevant = checks
        .iter()
        .filter(|c| c.kind().is_load_bound() || c.kind() == CheckKind::SchedulingConflict)
        .cloned()
        .collect();
    WindowScanner::new(relevant, lookahead_hours)
}

impl ChangeValidator {
    /// Validator reading snapshots published to `store`
    pub fn new(config: &EngineConfig, store: Arc<SnapshotStore>) -> Result<Self> {
        config.validator.validate()?;
        let checks = default_pipeline();
        Ok(Self {
            scanner: scanner_for(&checks, config.validator.lookahead_hours),
            simulator: Simulator::new(RackScorer::new(config.scoring.clone()), &config.validator),
            config: config.validator.clone(),
            checks,
            registry: Arc::new(ChangeRegistry::new(config.validator.max_commit_retries)),
            store,
            engine_metrics: None,
            metrics: ValidatorMetrics::default(),
        })
    }

    /// Validator over an engine's snapshots, reporting verdicts to its metrics
    pub fn for_engine(engine: &RiskEngine) -> Result<Self> {
        Ok(Self::new(engine.config(), engine.store().clone())?
            .with_engine_metrics(engine.metrics().clone()))
    }

    pub fn with_engine_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.engine_metrics = Some(metrics);
        self
    }

    /// Replace the check pipeline. Results are reported in the given order.
    pub fn with_checks(mut self, checks: Vec<Arc<dyn ConstraintCheck>>) -> Self {
        self.scanner = scanner_for(&checks, self.config.lookahead_hours);
        self.checks = checks;
        self
    }

    pub fn registry(&self) -> &Arc<ChangeRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &ValidatorMetrics {
        &self.metrics
    }

    pub fn get(&self, id: &ChangeId) -> Result<ChangeRequest> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<ChangeRequest> {
        self.registry.view().requests.values().cloned().collect()
    }

    /// Register a request as a draft without validating it
    pub fn draft(&self, spec: ChangeSpec) -> Result<ChangeId> {
        spec.validate()?;
        let request = self
            .registry
            .insert(ChangeRequest::draft(ChangeId::generate(), spec))?;
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(id = %request.id, target = %request.spec.target, "Change request drafted");
        Ok(request.id)
    }

    /// Register and validate a request
    pub fn submit(&self, spec: ChangeSpec) -> Result<Verdict> {
        let id = self.draft(spec)?;
        self.validate(&id)
    }

    /// Validate a draft (or re-validate a validated request)
    pub fn validate(&self, id: &ChangeId) -> Result<Verdict> {
        let begun = self.registry.update(id, |r| match r.state {
            ChangeState::Draft | ChangeState::Validated(_) => {
                Ok(Some(r.transitioned(ChangeState::Validating)))
            }
            other => Err(ValidatorError::invalid_transition(id, other, "validate")),
        })?;

        for attempt in 0..self.registry.max_retries() {
            let schedule = self.registry.view();
            let verdict = match self.evaluate_pinned(&begun, &schedule) {
                Ok(verdict) => verdict,
                Err(e) => {
                    if matches!(e, ValidatorError::InsufficientTopology { .. }) {
                        self.metrics
                            .insufficient_topology
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    warn!(id = %id, "Validation aborted: {}", e);
                    self.abandon(id);
                    return Err(e);
                }
            };

            let mut next = begun.transitioned(ChangeState::Validated(verdict.overall));
            next.verdict = Some(verdict.clone());
            let guard = CommitGuard {
                revision: begun.revision,
                reservations: Some(schedule.reservations),
            };
            match self.registry.commit(next, guard) {
                Ok(_) => {
                    self.metrics.record(&verdict);
                    if let Some(metrics) = &self.engine_metrics {
                        metrics.record_validation(verdict.overall.as_str());
                    }
                    info!(
                        id = %id,
                        verdict = %verdict.overall,
                        snapshot = verdict.snapshot_version,
                        findings = verdict.findings().count(),
                        partial = verdict.partial,
                        "Change request validated"
                    );
                    return Ok(verdict);
                }
                Err(e) if e.is_retryable() => {
                    self.metrics.commit_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %id, attempt, "Schedule changed during validation, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        self.abandon(id);
        Err(ValidatorError::ConcurrentModification(id.to_string()))
    }

    fn evaluate_pinned(&self, request: &ChangeRequest, schedule: &ScheduleView) -> Result<Verdict> {
        let snapshot = self
            .store
            .latest()
            .ok_or(ValidatorError::State(StateError::NoSnapshot))?;
        self.evaluate(&request.id, &request.spec, &snapshot, schedule)
    }

    /// Run the pipeline for `spec` against one snapshot and schedule view.
    /// Pure: nothing is recorded.
    pub fn evaluate(
        &self,
        id: &ChangeId,
        spec: &ChangeSpec,
        snapshot: &Snapshot,
        schedule: &ScheduleView,
    ) -> Result<Verdict> {
        let deadline = Instant::now() + self.config.time_budget;
        let impacts = resolve_impacts(spec, &snapshot.topology)?;
        let factor = load_factor(&self.config, &spec.window);
        let ctx = CheckContext {
            change_id: id,
            spec,
            window: spec.window,
            impacts: &impacts,
            snapshot,
            schedule,
            config: &self.config,
            load_factor: factor,
        };

        let checks = self
            .checks
            .iter()
            .map(|check| check.evaluate(&ctx))
            .collect::<Result<Vec<_>>>()?;
        let worst = checks
            .iter()
            .map(|c| c.outcome)
            .max()
            .unwrap_or(CheckOutcome::Pass);

        let simulation = self.simulator.project(snapshot, &impacts, deadline);
        let window_scan = if checks
            .iter()
            .any(|c| c.check.is_load_bound() && c.outcome != CheckOutcome::Pass)
        {
            Some(self.scanner.scan(&ctx, deadline)?)
        } else {
            None
        };
        let partial = simulation.partial || window_scan.as_ref().map_or(false, |s| s.partial);

        Ok(Verdict {
            evaluation_id: Uuid::new_v4(),
            change_id: id.clone(),
            overall: Overall::from_worst(worst),
            checks,
            simulation,
            window_scan,
            partial,
            load_factor: factor,
            snapshot_version: snapshot.version,
            schedule_version: schedule.reservations,
            evaluated_at: Utc::now(),
        })
    }

    /// Return a request stuck in `Validating` to `Draft`
    fn abandon(&self, id: &ChangeId) {
        let result = self.registry.update(id, |r| {
            Ok((r.state == ChangeState::Validating).then(|| r.transitioned(ChangeState::Draft)))
        });
        if let Err(e) = result {
            warn!(id = %id, "Failed to return change request to draft: {}", e);
        }
    }

    /// Approve a passing request. Approving an approved request is a no-op.
    pub fn approve(&self, id: &ChangeId) -> Result<ChangeRequest> {
        let request = self.registry.update(id, |r| match r.state {
            ChangeState::Approved => Ok(None),
            ChangeState::Validated(Overall::Pass | Overall::PassWithWarnings) => {
                Ok(Some(r.transitioned(ChangeState::Approved)))
            }
            other => Err(ValidatorError::invalid_transition(id, other, "approve")),
        })?;
        info!(id = %id, state = %request.state, "Change request approved");
        Ok(request)
    }

    /// Block a request. Blocking a blocked request is a no-op.
    pub fn block(&self, id: &ChangeId) -> Result<ChangeRequest> {
        let request = self.registry.update(id, |r| match r.state {
            ChangeState::Blocked => Ok(None),
            ChangeState::Draft | ChangeState::Validated(_) => {
                Ok(Some(r.transitioned(ChangeState::Blocked)))
            }
            other => Err(ValidatorError::invalid_transition(id, other, "block")),
        })?;
        info!(id = %id, "Change request blocked");
        Ok(request)
    }

    /// Move a request to a new window. It returns to `Draft` and its verdict
    /// is discarded.
    pub fn reschedule(&self, id: &ChangeId, window: ScheduledWindow) -> Result<ChangeRequest> {
        let window = ScheduledWindow::new(window.start, window.end)?;
        let request = self.registry.update(id, |r| match r.state {
            ChangeState::Draft | ChangeState::Validated(_) => {
                let mut next = r.transitioned(ChangeState::Draft);
                next.spec.window = window;
                next.verdict = None;
                Ok(Some(next))
            }
            other => Err(ValidatorError::invalid_transition(id, other, "reschedule")),
        })?;
        info!(id = %id, window = %window, "Change request rescheduled");
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeDeltas, ChangeTarget, ChangeType};
    use chrono::{Duration, TimeZone, Timelike};
    use uponline_core::topology::Topology;
    use uponline_core::{MetricKind, TelemetrySample};

    const FLOOR: &str = r#"
racks:
  - { id: A1, row: A, position: 1, cooling_zone: Zone A, pdu: PDU-A1 }
  - { id: A2, row: A, position: 2, cooling_zone: Zone A, pdu: PDU-A2 }
cooling_zones:
  - name: Zone A
    crah_units:
      - { name: CRAH-1, rated_capacity_kw: 60.0, setpoint_c: 22.0 }
      - { name: CRAH-2, rated_capacity_kw: 60.0, setpoint_c: 22.0 }
power_domains:
  - id: UPS-1
    kind: Ups
    rated_capacity_kw: 100.0
    redundant_units:
      - { name: UPS-1a, capacity_kw: 50.0 }
      - { name: UPS-1b, capacity_kw: 50.0 }
  - { id: PDU-A1, kind: Pdu, parent: UPS-1, rated_capacity_kw: 20.0 }
  - { id: PDU-A2, kind: Pdu, parent: UPS-1, rated_capacity_kw: 20.0 }
"#;

    fn setup() -> (RiskEngine, ChangeValidator) {
        let topology = Topology::from_yaml_str(FLOOR).unwrap();
        let engine = RiskEngine::new(EngineConfig::default(), topology).unwrap();
        let now = Utc::now();
        for (rack, inlet, power) in [("A1", 24.0, 8.0), ("A2", 24.0, 10.0)] {
            engine
                .apply_sample(&TelemetrySample::new(rack, MetricKind::PowerDraw, power, now))
                .unwrap();
            engine
                .apply_sample(&TelemetrySample::new(rack, MetricKind::InletTemperature, inlet, now))
                .unwrap();
        }
        engine.publish();
        let validator = ChangeValidator::for_engine(&engine).unwrap();
        (engine, validator)
    }

    fn spec(rack: &str, power: f64, hour: u32) -> ChangeSpec {
        let start = Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).unwrap();
        ChangeSpec {
            change_type: ChangeType::AddGpuNodes,
            target: ChangeTarget::Rack(rack.into()),
            source: None,
            deltas: ChangeDeltas::new(power, power),
            window: ScheduledWindow::new(start, start + Duration::hours(2)).unwrap(),
            requester: "ops".to_string(),
            description: None,
        }
    }

    #[test]
    fn test_submit_pass() {
        let (engine, validator) = setup();
        let verdict = validator.submit(spec("A1", 2.0, 12)).unwrap();

        assert_eq!(verdict.overall, Overall::Pass);
        assert_eq!(verdict.checks.len(), 5);
        assert!(verdict.window_scan.is_none());
        assert_eq!(verdict.simulation.racks.len(), 1);
        assert_eq!(verdict.simulation.racks[0].projected_power_kw, Some(10.0));

        let stored = validator.get(&verdict.change_id).unwrap();
        assert_eq!(stored.state, ChangeState::Validated(Overall::Pass));
        assert_eq!(stored.verdict.as_ref(), Some(&verdict));
        assert_eq!(validator.metrics().passed.load(Ordering::Relaxed), 1);
        assert!(engine.metrics().gather_text().unwrap().contains("uponline_validations_total"));
    }

    #[test]
    fn test_power_fail_suggests_nothing_when_load_never_drops_enough() {
        let (_engine, validator) = setup();
        let verdict = validator.submit(spec("A1", 15.0, 12)).unwrap();
        assert_eq!(verdict.overall, Overall::Fail);
        assert_eq!(
            verdict.check(CheckKind::PowerHeadroom).unwrap().outcome,
            CheckOutcome::Fail
        );
        let scan = verdict.window_scan.as_ref().unwrap();
        assert!(scan.suggestion.is_none());
        assert!(!scan.partial);
        assert_eq!(scan.candidates_scanned, 48);
        assert!(!verdict.partial);
    }

    #[test]
    fn test_exhausted_time_budget_marks_verdict_partial() {
        let (engine, _) = setup();
        let mut config = EngineConfig::default();
        config.validator.time_budget = std::time::Duration::from_nanos(1);
        let validator = ChangeValidator::new(&config, engine.store().clone()).unwrap();

        let verdict = validator.submit(spec("A1", 15.0, 12)).unwrap();
        assert_eq!(verdict.overall, Overall::Fail);
        assert!(verdict.partial);
        assert!(verdict.simulation.partial);
        assert!(verdict.simulation.racks.is_empty());

        let scan = verdict.window_scan.as_ref().unwrap();
        assert!(scan.partial);
        assert_eq!(scan.candidates_scanned, 0);
        assert!(scan.suggestion.is_none());
        assert_eq!(validator.metrics().partial_results.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_missing_target_is_insufficient_topology() {
        let (_engine, validator) = setup();
        let result = validator.submit(spec("Z9", 1.0, 12));
        assert!(matches!(result, Err(ValidatorError::InsufficientTopology { .. })));

        let drafts: Vec<_> = validator.list();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].state, ChangeState::Draft);
        assert_eq!(validator.metrics().insufficient_topology.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (_engine, validator) = setup();
        let id = validator.draft(spec("A1", 1.0, 12)).unwrap();
        assert!(matches!(
            validator.approve(&id),
            Err(ValidatorError::InvalidTransition { .. })
        ));

        validator.validate(&id).unwrap();
        let approved = validator.approve(&id).unwrap();
        let again = validator.approve(&id).unwrap();
        assert_eq!(approved, again);
        assert_eq!(again.state, ChangeState::Approved);

        assert!(validator.block(&id).is_err());
        assert!(validator.reschedule(&id, spec("A1", 1.0, 3).window).is_err());
        assert!(validator.validate(&id).is_err());
    }

    #[test]
    fn test_failed_request_cannot_be_approved_but_can_be_blocked() {
        let (_engine, validator) = setup();
        let verdict = validator.submit(spec("A1", 15.0, 12)).unwrap();
        let id = verdict.change_id;
        assert!(matches!(
            validator.approve(&id),
            Err(ValidatorError::InvalidTransition { .. })
        ));
        assert_eq!(validator.block(&id).unwrap().state, ChangeState::Blocked);
        assert_eq!(validator.block(&id).unwrap().revision, 3);
    }

    #[test]
    fn test_reserved_windows_conflict() {
        let (_engine, validator) = setup();
        let first = validator.submit(spec("A1", 1.0, 12)).unwrap();
        validator.approve(&first.change_id).unwrap();

        let overlapping = validator.submit(spec("A1", 1.0, 13)).unwrap();
        assert_eq!(overlapping.overall, Overall::Fail);
        let conflict = overlapping.check(CheckKind::SchedulingConflict).unwrap();
        assert!(conflict.explanation.contains(first.change_id.as_str()));

        let other_rack = validator.submit(spec("A2", 1.0, 13)).unwrap();
        assert_eq!(other_rack.check(CheckKind::SchedulingConflict).unwrap().outcome, CheckOutcome::Pass);

        let later = validator.submit(spec("A1", 1.0, 14)).unwrap();
        assert_eq!(later.overall, Overall::Pass);
    }

    #[test]
    fn test_reschedule_clears_verdict() {
        let (_engine, validator) = setup();
        let verdict = validator.submit(spec("A1", 1.0, 12)).unwrap();
        let moved = validator
            .reschedule(&verdict.change_id, spec("A1", 1.0, 2).window)
            .unwrap();
        assert_eq!(moved.state, ChangeState::Draft);
        assert!(moved.verdict.is_none());
        assert_eq!(moved.spec.window.start.hour(), 2);

        let again = validator.validate(&verdict.change_id).unwrap();
        assert!((again.load_factor - 0.82).abs() < 1e-9);
        assert_ne!(again.evaluation_id, verdict.evaluation_id);
    }

    #[test]
    fn test_no_snapshot() {
        let topology = Topology::from_yaml_str(FLOOR).unwrap();
        let engine = RiskEngine::new(EngineConfig::default(), topology).unwrap();
        let validator = ChangeValidator::for_engine(&engine).unwrap();
        assert!(matches!(
            validator.submit(spec("A1", 1.0, 12)),
            Err(ValidatorError::State(StateError::NoSnapshot))
        ));
    }
}
