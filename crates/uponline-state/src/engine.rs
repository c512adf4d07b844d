//! Live risk engine state
//!
//! Entities live in arenas indexed by their position in the topology. Each
//! rack, node and CRAH unit has its own lock so samples for different
//! entities never block each other, and each training job has its own mutex
//! so the derived fields of a job have a single writer at a time.
//!
//! Writers hold the shared side of a publish gate for the whole of one
//! sample application; the snapshot builder takes the exclusive side, so a
//! published snapshot never contains a half-applied update.

use crate::health::{aggregate_cluster, assess_node, node_thermal_score, NodeAssessment, NodeSignals, NodeSummary};
use crate::metrics::EngineMetrics;
use crate::propagation::{evaluate_job, DependencyGraph, JobRisk, PlacementRisk, RiskTrace};
use crate::risks::{derive_active_risks, fleet_summary, RiskInputs};
use crate::scoring::{knee_curve, RackScorer, RollingWindow, ScoreBreakdown, ScoreInputs};
use crate::snapshot::{
    ClusterView, CrahView, JobView, NodeView, PowerDomainView, PowerUnitView, RackView, Snapshot,
    ZoneView,
};
use crate::store::SnapshotStore;
use crate::{Result, StateError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uponline_core::config::{EngineConfig, GpuThresholds};
use uponline_core::topology::{CoolingZoneSpec, Topology};
use uponline_core::{
    EntityRef, Error as CoreError, MetricKind, Normalizer, NodeId, Reading, RiskLevel,
    TelemetrySample, UnitStatus,
};

/// Last accepted timestamp of one entity, shared by all of its metrics.
/// A sample older than the last accepted one is rejected; equal timestamps
/// are accepted so one scrape can carry several metrics.
#[derive(Debug, Clone, Default)]
struct EntityClock {
    last: Option<DateTime<Utc>>,
}

impl EntityClock {
    fn accept(&mut self, reading: &Reading) -> std::result::Result<(), CoreError> {
        match self.last {
            Some(last) if reading.timestamp < last => Err(CoreError::invalid_sample(
                &reading.entity_id,
                reading.metric.as_str(),
                format!(
                    "timestamp {} is older than last accepted {}",
                    reading.timestamp.to_rfc3339(),
                    last.to_rfc3339()
                ),
            )),
            _ => {
                self.last = Some(reading.timestamp);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct RackState {
    clock: EntityClock,
    inlet_c: Option<f64>,
    power_kw: Option<f64>,
    window: RollingWindow,
    breakdown: Option<ScoreBreakdown>,
    score: u8,
    previous_score: Option<u8>,
    stale: bool,
    last_sample: Option<DateTime<Utc>>,
    /// Wall-clock time the last sample was applied
    last_ingest: Option<DateTime<Utc>>,
}

impl RackState {
    fn new(window_size: usize) -> Self {
        Self {
            clock: EntityClock::default(),
            inlet_c: None,
            power_kw: None,
            window: RollingWindow::new(window_size),
            breakdown: None,
            score: 0,
            previous_score: None,
            stale: false,
            last_sample: None,
            last_ingest: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct NodeState {
    clock: EntityClock,
    signals: NodeSignals,
    assessment: NodeAssessment,
    last_sample: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct CrahState {
    clock: EntityClock,
    supply_temperature_c: Option<f64>,
}

#[derive(Debug, Clone)]
struct JobState {
    risk: JobRisk,
    trace: Option<RiskTrace>,
    revision: u64,
}

/// Static cooling figures of a zone, fixed for one topology version
#[derive(Debug, Clone)]
struct ZoneCapacity {
    effective_kw: f64,
    largest_unit_kw: f64,
    worst_unit: Option<usize>,
}

fn status_factor(status: UnitStatus, degraded_factor: f64) -> f64 {
    match status {
        UnitStatus::Online => 1.0,
        UnitStatus::Degraded => degraded_factor,
        UnitStatus::Offline => 0.0,
    }
}

fn zone_capacity(zone: &CoolingZoneSpec, degraded_factor: f64) -> ZoneCapacity {
    let effective: Vec<f64> = zone
        .crah_units
        .iter()
        .map(|u| u.rated_capacity_kw * status_factor(u.status, degraded_factor))
        .collect();

    let worst_unit = zone
        .crah_units
        .iter()
        .enumerate()
        .map(|(i, u)| {
            let share = if u.rated_capacity_kw > 0.0 {
                effective[i] / u.rated_capacity_kw
            } else {
                0.0
            };
            (i, share, effective[i])
        })
        .fold(None::<(usize, f64, f64)>, |worst, candidate| match worst {
            Some(w) if (w.1, w.2) <= (candidate.1, candidate.2) => Some(w),
            _ => Some(candidate),
        })
        .map(|(i, _, _)| i);

    ZoneCapacity {
        effective_kw: effective.iter().sum(),
        largest_unit_kw: effective.iter().copied().fold(0.0, f64::max),
        worst_unit,
    }
}

fn margin_pct(capacity_kw: f64, load_kw: f64) -> Option<f64> {
    (capacity_kw > 0.0).then(|| 100.0 * (capacity_kw - load_kw) / capacity_kw)
}

/// Everything derived from one topology version
#[derive(Debug)]
struct LiveState {
    topology: Arc<Topology>,
    topology_version: u64,
    loaded_at: DateTime<Utc>,
    normalizer: Normalizer,
    graph: DependencyGraph,
    rack_pdu_capacity: Vec<f64>,
    rack_zone: Vec<usize>,
    zone_racks: Vec<Vec<usize>>,
    zone_capacity: Vec<ZoneCapacity>,
    node_thresholds: Vec<GpuThresholds>,
    racks: Vec<RwLock<RackState>>,
    nodes: Vec<RwLock<NodeState>>,
    crahs: Vec<Vec<RwLock<CrahState>>>,
    jobs: Vec<Mutex<JobState>>,
    gate: RwLock<()>,
    /// Set once a newer topology has replaced this state
    retired: AtomicBool,
}

impl LiveState {
    fn build(topology: Topology, version: u64, config: &EngineConfig) -> Result<Self> {
        let normalizer = Normalizer::new(&topology, config.ingest.ranges.clone())?;
        let graph = DependencyGraph::build(&topology, version)?;

        let zone_index: HashMap<_, _> = topology
            .cooling_zones
            .iter()
            .enumerate()
            .map(|(i, z)| (&z.name, i))
            .collect();

        let mut rack_zone = Vec::with_capacity(topology.racks.len());
        let mut rack_pdu_capacity = Vec::with_capacity(topology.racks.len());
        let mut zone_racks = vec![Vec::new(); topology.cooling_zones.len()];
        for (i, rack) in topology.racks.iter().enumerate() {
            let zone = *zone_index.get(&rack.cooling_zone).ok_or_else(|| {
                StateError::Graph(format!("rack {} has no cooling zone", rack.id))
            })?;
            let pdu = topology.power_domain(&rack.pdu).ok_or_else(|| {
                StateError::Graph(format!("rack {} has no pdu", rack.id))
            })?;
            rack_zone.push(zone);
            rack_pdu_capacity.push(pdu.rated_capacity_kw);
            zone_racks[zone].push(i);
        }

        let node_thresholds = topology
            .nodes
            .iter()
            .map(|n| {
                let model = topology
                    .cluster(&n.cluster)
                    .map(|c| c.gpu_model.as_str())
                    .unwrap_or_default();
                config.health.thresholds_for(model).clone()
            })
            .collect();

        let zone_capacity = topology
            .cooling_zones
            .iter()
            .map(|z| zone_capacity(z, config.scoring.degraded_unit_factor))
            .collect();

        let window = config.scoring.window_size;
        let racks = (0..topology.racks.len())
            .map(|_| RwLock::new(RackState::new(window)))
            .collect();
        let nodes = (0..topology.nodes.len())
            .map(|_| RwLock::new(NodeState::default()))
            .collect();
        let crahs = topology
            .cooling_zones
            .iter()
            .map(|z| z.crah_units.iter().map(|_| RwLock::new(CrahState::default())).collect())
            .collect();
        let jobs = topology
            .jobs
            .iter()
            .enumerate()
            .map(|(j, spec)| {
                let unscored: Vec<PlacementRisk> = graph
                    .placements(j)
                    .iter()
                    .map(|p| PlacementRisk {
                        node: p.node,
                        rack: p.rack,
                        gpus: p.gpus,
                        rack_score: 0,
                        rack_level: RiskLevel::from_score(0, &config.scoring.buckets),
                        node_throttled: false,
                    })
                    .collect();
                Mutex::new(JobState {
                    risk: evaluate_job(spec.status, &unscored, &config.propagation),
                    trace: None,
                    revision: 0,
                })
            })
            .collect();

        Ok(Self {
            topology: Arc::new(topology),
            topology_version: version,
            loaded_at: Utc::now(),
            normalizer,
            graph,
            rack_pdu_capacity,
            rack_zone,
            zone_racks,
            zone_capacity,
            node_thresholds,
            racks,
            nodes,
            crahs,
            jobs,
            gate: RwLock::new(()),
            retired: AtomicBool::new(false),
        })
    }

    fn zone_heat_kw(&self, zone: usize) -> f64 {
        self.zone_racks[zone]
            .iter()
            .filter(|&&r| !self.topology.racks[r].retired)
            .filter_map(|&r| self.racks[r].read().power_kw)
            .sum()
    }

    fn zone_margin_pct(&self, zone: usize) -> Option<f64> {
        margin_pct(self.zone_capacity[zone].effective_kw, self.zone_heat_kw(zone))
    }
}

/// Result of applying one accepted sample
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutcome {
    pub entity_id: String,
    pub metric: MetricKind,
    pub rack_score: Option<u8>,
    pub jobs_updated: usize,
}

/// The risk scoring, health aggregation and propagation engine
#[derive(Debug)]
pub struct RiskEngine {
    config: Arc<EngineConfig>,
    scorer: RackScorer,
    live: RwLock<Arc<LiveState>>,
    topology_version: AtomicU64,
    store: Arc<SnapshotStore>,
    metrics: Arc<EngineMetrics>,
    publish_lock: Mutex<()>,
    /// Serializes topology reloads
    reload_lock: Mutex<()>,
}

impl RiskEngine {
    /// Create an engine for `topology`. The topology is validated first.
    pub fn new(config: EngineConfig, topology: Topology) -> Result<Self> {
        let store = Arc::new(SnapshotStore::new(config.snapshot.history));
        Self::with_store(config, topology, store)
    }

    pub fn with_store(
        config: EngineConfig,
        topology: Topology,
        store: Arc<SnapshotStore>,
    ) -> Result<Self> {
        config.validate()?;
        topology.validate()?;

        let live = LiveState::build(topology, 1, &config)?;
        let metrics = Arc::new(EngineMetrics::new()?);
        metrics.topology_version.set(1);
        info!(
            racks = live.racks.len(),
            nodes = live.nodes.len(),
            jobs = live.jobs.len(),
            "Risk engine initialized"
        );

        Ok(Self {
            scorer: RackScorer::new(config.scoring.clone()),
            config: Arc::new(config),
            live: RwLock::new(Arc::new(live)),
            topology_version: AtomicU64::new(1),
            store,
            metrics,
            publish_lock: Mutex::new(()),
            reload_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scorer(&self) -> &RackScorer {
        &self.scorer
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.live.read().topology.clone()
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version.load(Ordering::SeqCst)
    }

    /// Whether samples for `entity_id` can be applied under the current
    /// topology
    pub fn knows_entity(&self, entity_id: &str) -> bool {
        self.live.read().normalizer.resolve(entity_id).is_some()
    }

    fn current(&self) -> Arc<LiveState> {
        self.live.read().clone()
    }

    /// Run `f` against the current live state while holding its gate,
    /// re-pinning if a reload retired the state in between
    fn with_live<T>(&self, mut f: impl FnMut(&LiveState) -> T) -> T {
        loop {
            let live = self.current();
            let _gate = live.gate.read();
            if live.retired.load(Ordering::SeqCst) {
                continue;
            }
            return f(&live);
        }
    }

    /// Replace the topology. Readings of racks, nodes and CRAH units whose
    /// ids survive are carried over; the dependency graph is rebuilt and
    /// every job re-evaluated. Returns the new topology version.
    pub fn load_topology(&self, topology: Topology) -> Result<u64> {
        topology.validate()?;

        let _reloading = self.reload_lock.lock();
        let old = self.current();
        let _gate = old.gate.write();
        let version = self.topology_version.load(Ordering::SeqCst) + 1;
        let live = LiveState::build(topology, version, &self.config)?;

        let mut carried = 0usize;
        for (i, rack) in live.topology.racks.iter().enumerate() {
            if let Some(EntityRef::Rack(prev)) = old.normalizer.resolve(rack.id.as_str()) {
                let mut state = old.racks[prev].read().clone();
                if let Some(breakdown) = self.score_rack(&state, live.rack_pdu_capacity[i]) {
                    state.score = breakdown.score;
                    state.breakdown = Some(breakdown);
                }
                *live.racks[i].write() = state;
                carried += 1;
            }
        }
        for (i, node) in live.topology.nodes.iter().enumerate() {
            if let Some(EntityRef::Node(prev)) = old.normalizer.resolve(node.hostname.as_str()) {
                let mut state = old.nodes[prev].read().clone();
                state.assessment =
                    assess_node(&state.signals, &live.node_thresholds[i], &self.config.health);
                *live.nodes[i].write() = state;
                carried += 1;
            }
        }
        for (z, zone) in live.topology.cooling_zones.iter().enumerate() {
            for (u, unit) in zone.crah_units.iter().enumerate() {
                if let Some(EntityRef::Crah { zone: pz, unit: pu }) =
                    old.normalizer.resolve(unit.name.as_str())
                {
                    *live.crahs[z][u].write() = old.crahs[pz][pu].read().clone();
                }
            }
        }
        for job in 0..live.jobs.len() {
            self.refresh_job(&live, job);
        }

        let jobs = live.jobs.len();
        *self.live.write() = Arc::new(live);
        old.retired.store(true, Ordering::SeqCst);
        self.topology_version.store(version, Ordering::SeqCst);
        self.metrics.topology_version.set(version as i64);

        info!(version, carried, jobs, "Topology loaded, dependency graph rebuilt");
        Ok(version)
    }

    /// Apply one telemetry sample: normalize, update the entity, rescore,
    /// and propagate to dependent jobs. Rejected samples are logged and
    /// counted; they never touch entity state.
    pub fn apply_sample(&self, sample: &TelemetrySample) -> Result<SampleOutcome> {
        loop {
            let live = self.current();
            let reading = match live.normalizer.normalize(sample) {
                Ok(reading) => reading,
                Err(e) => return Err(self.reject(sample, e)),
            };

            let _gate = live.gate.read();
            if live.retired.load(Ordering::SeqCst) {
                continue;
            }

            let outcome = match reading.entity {
                EntityRef::Rack(rack) => self.apply_rack(&live, rack, &reading),
                EntityRef::Node(node) => self.apply_node(&live, node, &reading),
                EntityRef::Crah { zone, unit } => self.apply_crah(&live, zone, unit, &reading),
            };
            return match outcome {
                Ok(outcome) => {
                    self.metrics.samples_accepted.inc();
                    Ok(outcome)
                }
                Err(e) => Err(self.reject(sample, e)),
            };
        }
    }

    fn reject(&self, sample: &TelemetrySample, error: CoreError) -> StateError {
        self.metrics.record_rejection(error.category());
        warn!(
            entity = %sample.entity_id,
            metric = %sample.metric_kind,
            value = sample.value,
            "Dropped telemetry sample: {}",
            error
        );
        error.into()
    }

    fn apply_rack(
        &self,
        live: &LiveState,
        rack: usize,
        reading: &Reading,
    ) -> std::result::Result<SampleOutcome, CoreError> {
        let score = {
            let mut state = live.racks[rack].write();
            state.clock.accept(reading)?;
            match reading.metric {
                MetricKind::InletTemperature => {
                    state.inlet_c = Some(reading.value);
                    state.window.push_inlet(reading.value);
                }
                MetricKind::PowerDraw => {
                    state.power_kw = Some(reading.value);
                    state.window.push_power(reading.value);
                }
                _ => {}
            }
            state.last_sample = state.last_sample.max(Some(reading.timestamp));
            state.last_ingest = Some(Utc::now());
            if state.stale {
                debug!(rack = %reading.entity_id, "Rack telemetry resumed");
                state.stale = false;
            }

            if let Some(breakdown) = self.score_rack(&state, live.rack_pdu_capacity[rack]) {
                if state.breakdown.is_some() {
                    state.previous_score = Some(state.score);
                }
                state.score = breakdown.score;
                state.breakdown = Some(breakdown);
                self.metrics
                    .rack_risk_score
                    .with_label_values(&[reading.entity_id.as_str()])
                    .set(i64::from(breakdown.score));
                Some(breakdown.score)
            } else {
                None
            }
        };

        let jobs = live.graph.jobs_for_rack(rack);
        for &job in jobs {
            self.refresh_job(live, job);
        }

        Ok(SampleOutcome {
            entity_id: reading.entity_id.clone(),
            metric: reading.metric,
            rack_score: score,
            jobs_updated: jobs.len(),
        })
    }

    /// Score a rack from its latest readings, or `None` before it has
    /// reported either inlet temperature or power draw
    fn score_rack(&self, state: &RackState, pdu_capacity_kw: f64) -> Option<ScoreBreakdown> {
        if state.inlet_c.is_none() && state.power_kw.is_none() {
            return None;
        }
        Some(self.scorer.score(&ScoreInputs {
            inlet_c: state.inlet_c,
            power_kw: state.power_kw,
            pdu_capacity_kw,
            volatility: self.scorer.volatility_subscore(&state.window),
        }))
    }

    fn apply_node(
        &self,
        live: &LiveState,
        node: usize,
        reading: &Reading,
    ) -> std::result::Result<SampleOutcome, CoreError> {
        let throttle_changed = {
            let mut state = live.nodes[node].write();
            state.clock.accept(reading)?;
            let value = Some(reading.value);
            match reading.metric {
                MetricKind::GpuTemperature => state.signals.gpu_temperature_c = value,
                MetricKind::GpuUtilization => state.signals.utilization_pct = value,
                MetricKind::MemoryUsage => state.signals.memory_pct = value,
                MetricKind::NvlinkHealth => state.signals.nvlink_pct = value,
                MetricKind::XidErrors => state.signals.xid_errors = value,
                _ => {}
            }
            state.last_sample = state.last_sample.max(Some(reading.timestamp));

            let before = state.assessment;
            state.assessment =
                assess_node(&state.signals, &live.node_thresholds[node], &self.config.health);
            if state.assessment.health != before.health {
                debug!(
                    node = %reading.entity_id,
                    from = %before.health,
                    to = %state.assessment.health,
                    "Node health changed"
                );
            }
            state.assessment.is_throttled() != before.is_throttled()
        };

        let mut jobs_updated = 0;
        if throttle_changed {
            for &job in live.graph.jobs_for_node(node) {
                self.refresh_job(live, job);
                jobs_updated += 1;
            }
        }

        Ok(SampleOutcome {
            entity_id: reading.entity_id.clone(),
            metric: reading.metric,
            rack_score: None,
            jobs_updated,
        })
    }

    fn apply_crah(
        &self,
        live: &LiveState,
        zone: usize,
        unit: usize,
        reading: &Reading,
    ) -> std::result::Result<SampleOutcome, CoreError> {
        let mut state = live.crahs[zone][unit].write();
        state.clock.accept(reading)?;
        state.supply_temperature_c = Some(reading.value);
        Ok(SampleOutcome {
            entity_id: reading.entity_id.clone(),
            metric: reading.metric,
            rack_score: None,
            jobs_updated: 0,
        })
    }

    /// Recompute a job's derived fields under its own lock
    fn refresh_job(&self, live: &LiveState, job: usize) {
        let spec = &live.topology.jobs[job];
        let mut state = live.jobs[job].lock();

        let placements: Vec<PlacementRisk> = live
            .graph
            .placements(job)
            .iter()
            .map(|p| {
                let rack_score = live.racks[p.rack].read().score;
                let node_throttled = live.nodes[p.node].read().assessment.is_throttled();
                PlacementRisk {
                    node: p.node,
                    rack: p.rack,
                    gpus: p.gpus,
                    rack_score,
                    rack_level: self.scorer.level(rack_score),
                    node_throttled,
                }
            })
            .collect();

        let risk = evaluate_job(spec.status, &placements, &self.config.propagation);
        let trace = match risk.worst_rack {
            Some(rack) if risk.infra_risk != RiskLevel::None => {
                let zone = live.rack_zone[rack];
                Some(RiskTrace {
                    rack: live.topology.racks[rack].id.clone(),
                    inlet_c: live.racks[rack].read().inlet_c,
                    rack_score: risk.worst_score,
                    rack_level: risk.infra_risk,
                    cooling_zone: live.topology.cooling_zones[zone].name.clone(),
                    zone_margin_pct: live.zone_margin_pct(zone),
                    throttled_nodes: risk.throttled_nodes,
                    affected_gpus: risk.affected_gpus,
                    assigned_gpus: risk.assigned_gpus,
                    slowdown_pct: risk.slowdown_pct,
                })
            }
            _ => None,
        };

        if state.risk.infra_risk != risk.infra_risk {
            debug!(
                job = %spec.name,
                from = %state.risk.infra_risk,
                to = %risk.infra_risk,
                slowdown_pct = risk.slowdown_pct,
                "Job infra risk changed"
            );
        }
        state.risk = risk;
        state.trace = trace;
        state.revision += 1;
    }

    /// Record the driver version a node reports. Drift against the cluster's
    /// expected version degrades cluster readiness.
    pub fn report_driver_version(&self, node: &NodeId, version: impl Into<String>) -> Result<()> {
        let version = version.into();
        self.with_live(|live| match live.normalizer.resolve(node.as_str()) {
            Some(EntityRef::Node(i)) => {
                live.nodes[i].write().signals.driver_version = Some(version.clone());
                Ok(())
            }
            _ => Err(CoreError::unknown_entity(node.as_str()).into()),
        })
    }

    /// Flag racks that have not reported within the staleness threshold.
    /// Age is measured from when the engine last applied a sample, not from
    /// producer timestamps, so a skewed producer clock neither hides nor
    /// fakes staleness. Scores are frozen, never reset. Returns the number
    /// newly flagged.
    pub fn mark_stale(&self, now: DateTime<Utc>) -> usize {
        let threshold = chrono::Duration::from_std(self.config.scoring.staleness_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        self.with_live(|live| {
            let mut flagged = 0;
            for (i, rack) in live.racks.iter().enumerate() {
                if live.topology.racks[i].retired {
                    continue;
                }
                let mut state = rack.write();
                let since = state.last_ingest.unwrap_or(live.loaded_at);
                if !state.stale && now - since > threshold {
                    state.stale = true;
                    flagged += 1;
                    warn!(
                        rack = %live.topology.racks[i].id,
                        age_secs = (now - since).num_seconds(),
                        frozen_score = state.score,
                        "Rack telemetry is stale"
                    );
                }
            }
            flagged
        })
    }

    /// Build a coherent snapshot and publish it as the latest version
    pub fn publish(&self) -> Arc<Snapshot> {
        let _publishing = self.publish_lock.lock();
        let snapshot = self.build_snapshot();
        let published = self.store.publish(snapshot);
        self.metrics.snapshot_version.set(published.version as i64);
        debug!(
            version = published.version,
            topology_version = published.topology_version,
            risks = published.active_risks.len(),
            "Snapshot published"
        );
        published
    }

    fn build_snapshot(&self) -> Snapshot {
        let live = self.current();
        let _gate = live.gate.write();
        let topology = &live.topology;
        let now = Utc::now();

        let mut racks = BTreeMap::new();
        for (i, spec) in topology.racks.iter().enumerate() {
            let state = live.racks[i].read();
            racks.insert(
                spec.id.clone(),
                RackView {
                    id: spec.id.clone(),
                    row: spec.row.clone(),
                    position: spec.position,
                    gpu_count: spec.gpu_count,
                    cooling_zone: spec.cooling_zone.clone(),
                    pdu: spec.pdu.clone(),
                    pdu_capacity_kw: live.rack_pdu_capacity[i],
                    retired: spec.retired,
                    inlet_c: state.inlet_c,
                    power_kw: state.power_kw,
                    thermal_margin_pct: state.breakdown.and_then(|b| b.thermal_margin_pct),
                    risk_score: state.score,
                    risk_level: self.scorer.level(state.score),
                    previous_score: state.previous_score,
                    trend: self.scorer.trend(state.previous_score, state.score),
                    breakdown: state.breakdown,
                    stale: state.stale,
                    last_sample: state.last_sample,
                },
            );
        }

        let mut zones = BTreeMap::new();
        for (z, spec) in topology.cooling_zones.iter().enumerate() {
            let capacity = &live.zone_capacity[z];
            let heat = live.zone_heat_kw(z);
            let crah_units = spec
                .crah_units
                .iter()
                .enumerate()
                .map(|(u, unit)| CrahView {
                    name: unit.name.clone(),
                    status: unit.status,
                    rated_capacity_kw: unit.rated_capacity_kw,
                    effective_capacity_kw: unit.rated_capacity_kw
                        * status_factor(unit.status, self.config.scoring.degraded_unit_factor),
                    setpoint_c: unit.setpoint_c,
                    supply_temperature_c: live.crahs[z][u].read().supply_temperature_c,
                })
                .collect();
            let zone_rack_ids = live.zone_racks[z]
                .iter()
                .map(|&r| topology.racks[r].id.clone())
                .collect();
            let max_rack_score = live.zone_racks[z]
                .iter()
                .map(|&r| live.racks[r].read().score)
                .max()
                .unwrap_or(0);
            let used = if capacity.effective_kw > 0.0 {
                heat / capacity.effective_kw
            } else if heat > 0.0 {
                1.0
            } else {
                0.0
            };
            zones.insert(
                spec.name.clone(),
                ZoneView {
                    name: spec.name.clone(),
                    racks: zone_rack_ids,
                    crah_units,
                    effective_capacity_kw: capacity.effective_kw,
                    heat_load_kw: heat,
                    margin_pct: margin_pct(capacity.effective_kw, heat),
                    worst_unit: capacity.worst_unit.map(|u| spec.crah_units[u].name.clone()),
                    largest_unit_kw: capacity.largest_unit_kw,
                    max_rack_score,
                    risk_score: knee_curve(
                        used,
                        self.config.scoring.knee_fraction,
                        self.config.scoring.knee_score,
                    )
                    .round() as u8,
                },
            );
        }

        let mut power_domains = BTreeMap::new();
        for domain in &topology.power_domains {
            let fed: Vec<&RackView> = topology
                .racks_under(&domain.id)
                .into_iter()
                .filter(|r| !r.retired)
                .filter_map(|r| racks.get(&r.id))
                .collect();
            let load: f64 = fed.iter().filter_map(|r| r.power_kw).sum();
            let headroom = domain.rated_capacity_kw - load;
            power_domains.insert(
                domain.id.clone(),
                PowerDomainView {
                    id: domain.id.clone(),
                    kind: domain.kind,
                    parent: domain.parent.clone(),
                    rated_capacity_kw: domain.rated_capacity_kw,
                    load_kw: load,
                    headroom_kw: headroom,
                    headroom_pct: 100.0 * headroom / domain.rated_capacity_kw,
                    redundant_units: domain
                        .redundant_units
                        .iter()
                        .map(|u| PowerUnitView {
                            name: u.name.clone(),
                            status: u.status,
                            capacity_kw: u.capacity_kw,
                        })
                        .collect(),
                    max_rack_score: fed.iter().map(|r| r.risk_score).max().unwrap_or(0),
                },
            );
        }

        let mut nodes = BTreeMap::new();
        for (i, spec) in topology.nodes.iter().enumerate() {
            let state = live.nodes[i].read();
            let thermal_score = match state.signals.gpu_temperature_c {
                Some(t) if state.assessment.thermal_anomaly => {
                    node_thermal_score(t, &live.node_thresholds[i])
                }
                _ => 0,
            };
            nodes.insert(
                spec.hostname.clone(),
                NodeView {
                    hostname: spec.hostname.clone(),
                    cluster: spec.cluster.clone(),
                    rack: spec.rack.clone(),
                    gpus: spec.gpus,
                    gpu_temperature_c: state.signals.gpu_temperature_c,
                    utilization_pct: state.signals.utilization_pct,
                    memory_pct: state.signals.memory_pct,
                    nvlink_pct: state.signals.nvlink_pct,
                    xid_errors: state.signals.xid_errors,
                    driver_version: state.signals.driver_version.clone(),
                    health: state.assessment.health,
                    thermal_anomaly: state.assessment.thermal_anomaly,
                    throttled: state.assessment.is_throttled(),
                    risk_score: thermal_score,
                    last_sample: state.last_sample,
                },
            );
        }

        let mut clusters = BTreeMap::new();
        for cluster in &topology.clusters {
            let members: Vec<(&NodeView, NodeSignals)> = nodes
                .values()
                .filter(|n: &&NodeView| n.cluster == cluster.name)
                .map(|n| {
                    let signals = NodeSignals {
                        gpu_temperature_c: n.gpu_temperature_c,
                        utilization_pct: n.utilization_pct,
                        memory_pct: n.memory_pct,
                        nvlink_pct: n.nvlink_pct,
                        xid_errors: n.xid_errors,
                        driver_version: n.driver_version.clone(),
                    };
                    (n, signals)
                })
                .collect();
            let summaries: Vec<NodeSummary<'_>> = members
                .iter()
                .map(|(n, signals)| NodeSummary {
                    assessment: NodeAssessment {
                        health: n.health,
                        thermal_anomaly: n.thermal_anomaly,
                    },
                    signals,
                })
                .collect();
            let cluster_racks = topology.cluster_racks(&cluster.name);
            let max_rack_score = cluster_racks
                .iter()
                .filter(|r| !r.retired)
                .filter_map(|r| racks.get(&r.id))
                .map(|r| r.risk_score)
                .max()
                .unwrap_or(0);
            clusters.insert(
                cluster.name.clone(),
                ClusterView {
                    name: cluster.name.clone(),
                    gpu_model: cluster.gpu_model.clone(),
                    expected_driver_version: cluster.driver_version.clone(),
                    gpu_count: members.iter().map(|(n, _)| n.gpus).sum(),
                    racks: cluster_racks.into_iter().map(|r| r.id.clone()).collect(),
                    max_rack_score,
                    risk_level: self.scorer.level(max_rack_score),
                    health: aggregate_cluster(&summaries, cluster.driver_version.as_deref()),
                },
            );
        }

        let mut jobs = BTreeMap::new();
        for (j, spec) in topology.jobs.iter().enumerate() {
            let state = live.jobs[j].lock();
            jobs.insert(
                spec.name.clone(),
                JobView {
                    name: spec.name.clone(),
                    cluster: spec.cluster.clone(),
                    base_status: spec.status,
                    status: state.risk.status,
                    assigned_gpus: state.risk.assigned_gpus,
                    racks: live
                        .graph
                        .job_racks(j)
                        .into_iter()
                        .map(|r| topology.racks[r].id.clone())
                        .collect(),
                    infra_risk: state.risk.infra_risk,
                    slowdown_pct: state.risk.slowdown_pct,
                    trace: state.trace.clone(),
                    expected_end: spec.expected_end,
                    revision: state.revision,
                },
            );
        }

        let node_refs: Vec<&NodeView> = nodes.values().collect();
        let active_risks = derive_active_risks(&RiskInputs {
            racks: &racks,
            zones: &zones,
            nodes: &node_refs,
            scoring: &self.config.scoring,
            thresholds: &self.config.risks,
        });
        let summary = fleet_summary(
            racks.values(),
            power_domains.values(),
            nodes.values(),
            jobs.values(),
            &active_risks,
        );

        Snapshot {
            version: 0,
            topology_version: live.topology_version,
            created_at: now,
            racks,
            zones,
            power_domains,
            nodes,
            clusters,
            jobs,
            active_risks,
            summary,
            topology: live.topology.clone(),
        }
    }
}

#[cfg(test)]
impl RiskEngine {
    /// Run `f` with the current publish gate held exclusively, stalling
    /// every sample writer until it returns
    pub(crate) fn with_writers_stalled<T>(&self, f: impl FnOnce() -> T) -> T {
        let live = self.current();
        let _gate = live.gate.write();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::ScoreFactor;
    use chrono::Duration;
    use std::sync::OnceLock;
    use uponline_core::{JobId, JobStatus, RackId, Readiness, RiskSeverity};

    const FLOOR: &str = r#"
racks:
  - { id: B3, row: B, position: 3, gpu_count: 8, cooling_zone: Zone B, pdu: PDU-B3 }
  - { id: B4, row: B, position: 4, gpu_count: 8, cooling_zone: Zone B, pdu: PDU-B4 }
cooling_zones:
  - name: Zone B
    crah_units:
      - { name: CRAH-3, rated_capacity_kw: 45.0, setpoint_c: 22.0 }
      - { name: CRAH-4, rated_capacity_kw: 45.0, setpoint_c: 22.0, status: Degraded }
power_domains:
  - { id: UPS-B, kind: Ups, rated_capacity_kw: 60.0 }
  - { id: PDU-B3, kind: Pdu, parent: UPS-B, rated_capacity_kw: 20.0 }
  - { id: PDU-B4, kind: Pdu, parent: UPS-B, rated_capacity_kw: 20.0 }
clusters:
  - { name: beta, gpu_model: H100 SXM, driver_version: "550.54.15" }
nodes:
  - { hostname: beta-node-07, cluster: beta, rack: B3 }
  - { hostname: beta-node-08, cluster: beta, rack: B4 }
jobs:
  - name: pretrain
    cluster: beta
    status: Running
    assignments: [{ node: beta-node-07, gpus: 4 }, { node: beta-node-08, gpus: 8 }]
  - { name: waiting, cluster: beta, status: Queued }
"#;

    fn engine() -> RiskEngine {
        RiskEngine::new(
            EngineConfig::default(),
            Topology::from_yaml_str(FLOOR).unwrap(),
        )
        .unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        static BASE: OnceLock<DateTime<Utc>> = OnceLock::new();
        *BASE.get_or_init(Utc::now) + Duration::seconds(secs)
    }

    fn feed(engine: &RiskEngine, entity: &str, metric: MetricKind, value: f64, secs: i64) {
        engine
            .apply_sample(&TelemetrySample::new(entity, metric, value, at(secs)))
            .unwrap();
    }

    #[test]
    fn test_hot_rack_propagates_to_job() {
        let engine = engine();
        feed(&engine, "B4", MetricKind::InletTemperature, 24.0, 0);
        feed(&engine, "B4", MetricKind::PowerDraw, 9.0, 0);
        feed(&engine, "B3", MetricKind::PowerDraw, 19.8, 0);
        feed(&engine, "B3", MetricKind::InletTemperature, 38.4, 0);

        let snapshot = engine.publish();
        let b3 = snapshot.rack(&RackId::new("B3")).unwrap();
        assert!(b3.risk_score >= 60);
        assert_eq!(b3.risk_level, RiskLevel::High);

        let job = snapshot.job(&JobId::new("pretrain")).unwrap();
        assert_eq!(job.infra_risk, RiskLevel::High);
        assert_eq!(job.status, JobStatus::AtRisk);
        // 4 of 12 GPUs on a High rack, tripled
        assert_eq!(job.slowdown_pct, 100.0);
        let trace = job.trace.as_ref().unwrap();
        assert_eq!(trace.rack.as_str(), "B3");
        assert_eq!(trace.cooling_zone.as_str(), "Zone B");
        assert!(trace.zone_margin_pct.is_some());

        let cluster = snapshot.cluster(&"beta".into()).unwrap();
        assert_eq!(cluster.max_rack_score, b3.risk_score);
        assert_eq!(cluster.risk_level, RiskLevel::High);

        let waiting = snapshot.job(&JobId::new("waiting")).unwrap();
        assert_eq!(waiting.infra_risk, RiskLevel::None);
        assert_eq!(waiting.status, JobStatus::Queued);

        assert!(snapshot
            .risks_at_least(RiskSeverity::Critical)
            .iter()
            .any(|r| r.id == "thermal-exceedance:B3"));
    }

    #[test]
    fn test_rejects_out_of_order_and_unknown() {
        let engine = engine();
        feed(&engine, "B3", MetricKind::InletTemperature, 25.0, 10);

        let stale = TelemetrySample::new("B3", MetricKind::InletTemperature, 30.0, at(5));
        assert!(matches!(
            engine.apply_sample(&stale),
            Err(StateError::Core(CoreError::InvalidSample { .. }))
        ));

        let unknown = TelemetrySample::new("Z9", MetricKind::PowerDraw, 1.0, at(20));
        assert!(matches!(
            engine.apply_sample(&unknown),
            Err(StateError::Core(CoreError::UnknownEntity(_)))
        ));

        let snapshot = engine.publish();
        assert_eq!(snapshot.rack(&RackId::new("B3")).unwrap().inlet_c, Some(25.0));
        assert_eq!(engine.metrics().samples_accepted.get(), 1);
    }

    #[test]
    fn test_ordering_is_per_entity_across_metrics() {
        let engine = engine();
        feed(&engine, "B3", MetricKind::InletTemperature, 25.0, 20);

        // an older power sample after a newer inlet sample is out of order
        let older = TelemetrySample::new("B3", MetricKind::PowerDraw, 12.0, at(15));
        assert!(matches!(
            engine.apply_sample(&older),
            Err(StateError::Core(CoreError::InvalidSample { .. }))
        ));

        // metrics of one scrape share a timestamp
        feed(&engine, "B3", MetricKind::PowerDraw, 10.0, 20);
        feed(&engine, "B3", MetricKind::InletTemperature, 26.0, 20);

        // other entities keep their own clock
        feed(&engine, "B4", MetricKind::PowerDraw, 9.0, 15);

        let snapshot = engine.publish();
        let b3 = snapshot.rack(&RackId::new("B3")).unwrap();
        assert_eq!(b3.power_kw, Some(10.0));
        assert_eq!(b3.inlet_c, Some(26.0));
        assert_eq!(snapshot.rack(&RackId::new("B4")).unwrap().power_kw, Some(9.0));
        assert_eq!(engine.metrics().samples_accepted.get(), 4);
    }

    #[test]
    fn test_rejected_sample_leaves_window_intact() {
        let engine = engine();
        for i in 0..6 {
            feed(&engine, "B3", MetricKind::InletTemperature, 25.0, i);
        }
        let bad = TelemetrySample::new("B3", MetricKind::InletTemperature, f64::NAN, at(7));
        assert!(engine.apply_sample(&bad).is_err());

        let snapshot = engine.publish();
        let breakdown = snapshot.rack(&RackId::new("B3")).unwrap().breakdown.unwrap();
        assert_eq!(breakdown.volatility, 0.0);
    }

    fn after(secs: i64) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(secs)
    }

    #[test]
    fn test_stale_rack_keeps_score() {
        let engine = engine();
        feed(&engine, "B3", MetricKind::PowerDraw, 19.8, 0);
        feed(&engine, "B3", MetricKind::InletTemperature, 38.4, 0);
        let before = engine.publish().rack(&RackId::new("B3")).unwrap().risk_score;

        // B4 never reported and counts from topology load
        assert_eq!(engine.mark_stale(after(301)), 2);
        assert_eq!(engine.mark_stale(after(400)), 0);

        let snapshot = engine.publish();
        let b3 = snapshot.rack(&RackId::new("B3")).unwrap();
        assert!(b3.stale);
        assert_eq!(b3.risk_score, before);
        assert!(snapshot
            .active_risks
            .iter()
            .any(|r| r.id == "stale-telemetry:B3"));
        assert_eq!(snapshot.summary.stale_racks, 2);

        feed(&engine, "B3", MetricKind::InletTemperature, 30.0, 500);
        assert!(!engine.publish().rack(&RackId::new("B3")).unwrap().stale);
    }

    #[test]
    fn test_staleness_ignores_producer_clock_skew() {
        let engine = engine();
        // producer clocks an hour behind and an hour ahead
        feed(&engine, "B3", MetricKind::InletTemperature, 25.0, -3600);
        feed(&engine, "B4", MetricKind::InletTemperature, 25.0, 3600);

        assert_eq!(engine.mark_stale(after(60)), 0);
        assert_eq!(engine.mark_stale(after(301)), 2);

        let snapshot = engine.publish();
        assert!(snapshot.rack(&RackId::new("B3")).unwrap().stale);
        assert!(snapshot.rack(&RackId::new("B4")).unwrap().stale);
    }

    #[test]
    fn test_power_only_rack_is_scored() {
        let engine = engine();
        feed(&engine, "B3", MetricKind::PowerDraw, 19.9, 0);

        let snapshot = engine.publish();
        let b3 = snapshot.rack(&RackId::new("B3")).unwrap();
        assert_eq!(b3.inlet_c, None);
        assert_eq!(b3.thermal_margin_pct, None);
        assert_eq!(b3.risk_score, 30);
        assert_eq!(b3.risk_level, RiskLevel::Medium);
        assert_eq!(b3.breakdown.unwrap().dominant, ScoreFactor::Power);

        let job = snapshot.job(&JobId::new("pretrain")).unwrap();
        assert_eq!(job.infra_risk, RiskLevel::Medium);
        assert_eq!(job.status, JobStatus::AtRisk);

        let risk = snapshot
            .active_risks
            .iter()
            .find(|r| r.id == "power-headroom:B3")
            .expect("power-only rack is listed");
        assert_eq!(risk.severity, RiskSeverity::Info);
        assert!(risk.detail.contains("no inlet temperature"));
    }

    #[test]
    fn test_node_signals_and_driver_drift() {
        let engine = engine();
        feed(&engine, "beta-node-08", MetricKind::GpuTemperature, 84.0, 0);
        feed(&engine, "beta-node-08", MetricKind::NvlinkHealth, 100.0, 0);
        engine
            .report_driver_version(&NodeId::new("beta-node-07"), "535.104.05")
            .unwrap();
        assert!(engine
            .report_driver_version(&NodeId::new("ghost"), "1.0")
            .is_err());

        let snapshot = engine.publish();
        let node = snapshot.node(&NodeId::new("beta-node-08")).unwrap();
        assert!(node.thermal_anomaly);
        assert!(node.risk_score >= 50);

        let cluster = snapshot.cluster(&"beta".into()).unwrap();
        assert_eq!(cluster.readiness(), Readiness::Degraded);
        assert_eq!(cluster.health.driver_drift, 1);
        assert_eq!(cluster.health.thermal_anomalies, 1);
        assert_eq!(cluster.health.nvlink_health_pct, Some(100.0));

        // a throttled node on an unscored rack carries no infra risk
        let job = snapshot.job(&JobId::new("pretrain")).unwrap();
        assert_eq!(job.trace, None);
        assert_eq!(job.infra_risk, RiskLevel::None);
    }

    #[test]
    fn test_zone_and_power_rollups() {
        let engine = engine();
        feed(&engine, "B3", MetricKind::PowerDraw, 19.8, 0);
        feed(&engine, "B4", MetricKind::PowerDraw, 18.9, 0);
        feed(&engine, "CRAH-3", MetricKind::SupplyTemperature, 17.5, 0);

        let snapshot = engine.publish();
        let zone = snapshot.zone(&"Zone B".into()).unwrap();
        assert_eq!(zone.effective_capacity_kw, 45.0 + 33.75);
        assert!((zone.heat_load_kw - 38.7).abs() < 1e-9);
        assert_eq!(zone.worst_unit.as_ref().map(|u| u.as_str()), Some("CRAH-4"));
        assert_eq!(zone.crah_units[0].supply_temperature_c, Some(17.5));

        let ups = snapshot.power_domain(&"UPS-B".into()).unwrap();
        assert!((ups.load_kw - 38.7).abs() < 1e-9);
        assert!(snapshot.summary.facility_power_headroom_pct.unwrap() > 30.0);
    }

    #[test]
    fn test_topology_reload_bumps_version_and_carries_readings() {
        let engine = engine();
        feed(&engine, "B3", MetricKind::InletTemperature, 38.4, 0);
        let first = engine.publish();

        let mut topology = Topology::from_yaml_str(FLOOR).unwrap();
        topology.jobs[0].assignments.retain(|a| a.node.as_str() != "beta-node-07");
        assert_eq!(engine.load_topology(topology).unwrap(), 2);
        assert_eq!(engine.topology_version(), 2);

        let second = engine.publish();
        assert_eq!(second.topology_version, 2);
        assert!(second.version > first.version);
        assert_eq!(second.rack(&RackId::new("B3")).unwrap().inlet_c, Some(38.4));
        let job = second.job(&JobId::new("pretrain")).unwrap();
        assert_eq!(job.assigned_gpus, 8);
        assert_eq!(job.infra_risk, RiskLevel::None);

        // pinned readers still see the old graph
        assert_eq!(first.job(&JobId::new("pretrain")).unwrap().assigned_gpus, 12);

        feed(&engine, "B3", MetricKind::InletTemperature, 30.0, 10);
    }

    #[test]
    fn test_concurrent_reloads_and_ingest_lose_nothing() {
        let engine = Arc::new(engine());
        let reloaders: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let topology = Topology::from_yaml_str(FLOOR).unwrap();
                        engine.load_topology(topology).unwrap();
                    }
                })
            })
            .collect();
        let ingest = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let t = 20.0 + (i % 10) as f64;
                    feed(&engine, "B3", MetricKind::InletTemperature, t, i);
                }
                feed(&engine, "B3", MetricKind::InletTemperature, 39.0, 1000);
            })
        };
        for handle in reloaders {
            handle.join().unwrap();
        }
        ingest.join().unwrap();

        assert_eq!(engine.topology_version(), 41);
        assert_eq!(engine.metrics().samples_accepted.get(), 201);

        let snapshot = engine.publish();
        assert_eq!(snapshot.topology_version, 41);
        let b3 = snapshot.rack(&RackId::new("B3")).unwrap();
        assert_eq!(b3.inlet_c, Some(39.0));
        assert_eq!(b3.risk_level, RiskLevel::High);
        assert_eq!(
            snapshot.job(&JobId::new("pretrain")).unwrap().infra_risk,
            RiskLevel::High
        );
    }

    #[test]
    fn test_invalid_topology_is_rejected() {
        let engine = engine();
        let mut topology = Topology::from_yaml_str(FLOOR).unwrap();
        topology.nodes[0].rack = RackId::new("Q1");
        assert!(engine.load_topology(topology).is_err());
        assert_eq!(engine.topology_version(), 1);
    }

    #[test]
    fn test_concurrent_racks_do_not_lose_job_updates() {
        let engine = Arc::new(engine());
        let handles: Vec<_> = ["B3", "B4"]
            .into_iter()
            .map(|rack| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let t = 30.0 + (i % 10) as f64;
                        feed(&engine, rack, MetricKind::InletTemperature, t, i);
                    }
                    feed(&engine, rack, MetricKind::InletTemperature, 39.0, 100);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = engine.publish();
        let job = snapshot.job(&JobId::new("pretrain")).unwrap();
        assert_eq!(job.infra_risk, RiskLevel::High);
        assert_eq!(job.revision, 102);
        assert_eq!(job.slowdown_pct, 100.0);
    }

    #[test]
    fn test_publish_is_versioned() {
        let engine = engine();
        let a = engine.publish();
        let b = engine.publish();
        assert_eq!(b.version, a.version + 1);
        assert_eq!(engine.store().latest().unwrap().version, b.version);
        assert_eq!(engine.metrics().snapshot_version.get(), b.version as i64);
    }
}
