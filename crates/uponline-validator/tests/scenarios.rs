//! End-to-end scenarios on the reference floor

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use uponline_core::topology::{GpuAssignment, Topology};
use uponline_core::{EngineConfig, JobStatus, MetricKind, RiskLevel, TelemetrySample};
use uponline_state::{QueryEngine, RiskEngine};
use uponline_validator::{
    ChangeDeltas, ChangeSpec, ChangeState, ChangeTarget, ChangeType, ChangeValidator, CheckKind,
    CheckOutcome, Overall, ScheduledWindow,
};

const FLOOR: &str = include_str!("../../../fixtures/floor.yaml");

/// Rack power draw in kW under normal load
const RACK_LOAD_KW: [(&str, f64); 12] = [
    ("A1", 14.2),
    ("A2", 15.8),
    ("A3", 12.1),
    ("A4", 13.6),
    ("B1", 16.4),
    ("B2", 17.1),
    ("B3", 19.8),
    ("B4", 18.9),
    ("C1", 10.4),
    ("C2", 11.2),
    ("C3", 10.8),
    ("C4", 11.5),
];

static CLOCK: AtomicI64 = AtomicI64::new(0);

fn tick() -> DateTime<Utc> {
    Utc::now() + Duration::milliseconds(CLOCK.fetch_add(1, Ordering::SeqCst))
}

fn floor() -> Topology {
    Topology::from_yaml_str(FLOOR).unwrap()
}

/// Engine fed one reading per rack: normal load at 24 °C unless overridden
fn engine_with(topology: Topology, overrides: &[(&str, f64, f64)]) -> RiskEngine {
    let engine = RiskEngine::new(EngineConfig::default(), topology).unwrap();
    for (rack, load) in RACK_LOAD_KW {
        let (inlet, power) = overrides
            .iter()
            .find(|(id, _, _)| *id == rack)
            .map(|(_, inlet, power)| (*inlet, *power))
            .unwrap_or((24.0, load));
        engine
            .apply_sample(&TelemetrySample::new(rack, MetricKind::PowerDraw, power, tick()))
            .unwrap();
        engine
            .apply_sample(&TelemetrySample::new(rack, MetricKind::InletTemperature, inlet, tick()))
            .unwrap();
    }
    engine.publish();
    engine
}

fn noon_window() -> ScheduledWindow {
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
    ScheduledWindow::new(start, start + Duration::hours(2)).unwrap()
}

fn add_to_a3(power_kw: f64, thermal_kw: f64) -> ChangeSpec {
    ChangeSpec {
        change_type: ChangeType::AddGpuNodes,
        target: ChangeTarget::Rack("A3".into()),
        source: None,
        deltas: ChangeDeltas::new(power_kw, thermal_kw),
        window: noon_window(),
        requester: "j.chen".to_string(),
        description: Some("Add 2x HGX nodes".to_string()),
    }
}

#[test]
fn hot_rack_propagates_to_training_job() {
    let engine = engine_with(
        floor(),
        &[
            ("B1", 24.0, 10.0),
            ("B2", 24.0, 10.0),
            ("B3", 38.4, 19.8),
            ("B4", 24.0, 10.0),
        ],
    );
    let query = QueryEngine::new(engine.store().clone());

    let b3 = query.get_rack(&"B3".into()).unwrap();
    assert!((78..=86).contains(&b3.risk_score), "score {}", b3.risk_score);
    assert_eq!(b3.risk_level, RiskLevel::High);
    assert!(b3.thermal_margin_pct.unwrap() < 0.0);

    let job = query.get_job(&"llm-pretrain-7b-run-042".into()).unwrap();
    assert_eq!(job.assigned_gpus, 80);
    assert_eq!(job.infra_risk, RiskLevel::High);
    assert_eq!(job.status, JobStatus::AtRisk);
    assert!(
        (10.0..=20.0).contains(&job.slowdown_pct),
        "slowdown {}",
        job.slowdown_pct
    );

    let trace = job.trace.expect("at-risk job carries a trace");
    assert_eq!(trace.rack.as_str(), "B3");
    assert_eq!(trace.cooling_zone.as_str(), "Zone B");
    assert_eq!(trace.affected_gpus, 4);

    let queued = query.get_job(&"code-gen-13b-run-007".into()).unwrap();
    assert_eq!(queued.infra_risk, RiskLevel::None);
    assert_eq!(queued.status, JobStatus::Queued);

    let risks = query
        .list_active_risks(uponline_core::RiskSeverity::Critical)
        .unwrap();
    assert_eq!(risks[0].id, "thermal-exceedance:B3");
}

#[test]
fn a3_expansion_passes_with_headroom() {
    let engine = engine_with(floor(), &[]);
    let validator = ChangeValidator::for_engine(&engine).unwrap();

    let verdict = validator.submit(add_to_a3(3.0, 3.0)).unwrap();
    let power = verdict.check(CheckKind::PowerHeadroom).unwrap();
    assert_eq!(power.outcome, CheckOutcome::Pass);
    assert!((power.headroom_pct.unwrap() - 24.5).abs() < 0.01);

    let cooling = verdict.check(CheckKind::CoolingCapacity).unwrap();
    assert!(cooling.headroom_pct.unwrap() >= 15.0);
    assert_eq!(verdict.overall, Overall::Pass, "{:#?}", verdict.checks);
    assert!(verdict.window_scan.is_none());

    let projection = &verdict.simulation.racks[0];
    assert_eq!(projection.rated_power_kw, 20.0);
    assert!((projection.projected_power_kw.unwrap() - 15.1).abs() < 1e-9);
    assert!(projection.projected_inlet_c.unwrap() > 24.0);
}

#[test]
fn a3_expansion_fails_when_high_risk_job_is_exposed() {
    let mut topology = floor();
    let job = topology
        .jobs
        .iter_mut()
        .find(|j| j.name.as_str() == "vision-transformer-v3")
        .unwrap();
    job.assignments.push(GpuAssignment {
        node: "alpha-node-03".into(),
        gpus: 8,
    });
    let engine = engine_with(topology, &[("A1", 39.0, 14.2)]);
    let validator = ChangeValidator::for_engine(&engine).unwrap();

    let verdict = validator.submit(add_to_a3(3.0, 3.0)).unwrap();
    assert_eq!(verdict.overall, Overall::Fail);
    assert_eq!(
        verdict.check(CheckKind::PowerHeadroom).unwrap().outcome,
        CheckOutcome::Pass
    );
    let exposure = verdict.check(CheckKind::JobExposure).unwrap();
    assert_eq!(exposure.outcome, CheckOutcome::Fail);
    assert_eq!(exposure.subject, "vision-transformer-v3");
}

#[test]
fn approve_is_idempotent() {
    let engine = engine_with(floor(), &[]);
    let validator = ChangeValidator::for_engine(&engine).unwrap();
    let verdict = validator.submit(add_to_a3(3.0, 3.0)).unwrap();

    let first = validator.approve(&verdict.change_id).unwrap();
    let second = validator.approve(&verdict.change_id).unwrap();
    assert_eq!(first.state, ChangeState::Approved);
    assert_eq!(first, second);
    assert_eq!(first.history.len(), 3);
}

#[test]
fn failed_change_rescheduled_to_suggested_window_passes() {
    let engine = engine_with(floor(), &[]);
    let validator = ChangeValidator::for_engine(&engine).unwrap();

    let verdict = validator.submit(add_to_a3(3.0, 22.0)).unwrap();
    assert_eq!(verdict.overall, Overall::Fail);
    assert_eq!(
        verdict.check(CheckKind::RedundancyMargin).unwrap().outcome,
        CheckOutcome::Fail
    );

    let suggested = *verdict.suggested_window().expect("a lower-load window exists");
    assert_eq!(suggested.start.hour(), 0);
    assert_eq!(suggested.duration(), Duration::hours(2));
    assert!(!verdict.partial);

    let rescheduled = validator.reschedule(&verdict.change_id, suggested).unwrap();
    assert_eq!(rescheduled.state, ChangeState::Draft);
    assert!(rescheduled.verdict.is_none());

    let second = validator.validate(&verdict.change_id).unwrap();
    assert_eq!(second.overall, Overall::Pass, "{:#?}", second.checks);
    assert!((second.load_factor - 0.86).abs() < 1e-9);
}

#[test]
fn cluster_change_reports_exposed_job() {
    let engine = engine_with(floor(), &[]);
    let validator = ChangeValidator::for_engine(&engine).unwrap();

    let spec = ChangeSpec {
        change_type: ChangeType::FirmwareUpdate,
        target: ChangeTarget::Cluster("gamma".into()),
        source: None,
        deltas: ChangeDeltas::default(),
        window: noon_window(),
        requester: "ops".to_string(),
        description: None,
    };
    let verdict = validator.submit(spec).unwrap();

    assert_eq!(verdict.simulation.racks.len(), 4);
    let exposure = verdict.check(CheckKind::JobExposure).unwrap();
    assert_eq!(exposure.outcome, CheckOutcome::Warning);
    assert_eq!(exposure.subject, "speech-recognition-ft");
    assert_eq!(verdict.overall, Overall::PassWithWarnings);
}

#[test]
fn verdict_serializes_for_the_approver() {
    let engine = engine_with(floor(), &[]);
    let validator = ChangeValidator::for_engine(&engine).unwrap();
    let verdict = validator.submit(add_to_a3(3.0, 3.0)).unwrap();

    let json = serde_json::to_value(&verdict).unwrap();
    assert_eq!(json["overall"], "Pass");
    assert_eq!(json["checks"].as_array().unwrap().len(), 5);
    assert_eq!(json["checks"][0]["check"], "PowerHeadroom");
}
