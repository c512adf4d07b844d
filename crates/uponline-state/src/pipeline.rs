//! Async telemetry ingestion pipeline
//!
//! Each entity gets its own bounded queue and worker task, created on its
//! first sample, so a burst on one rack never delays another and samples of
//! one entity are applied in arrival order. Workers mark the engine dirty;
//! a single publisher task coalesces dirty notifications into snapshot
//! publishes. A sweeper flags racks whose telemetry has gone stale.

use crate::engine::RiskEngine;
use crate::{Result, StateError};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uponline_core::{TelemetrySample, TelemetrySource};

/// Pipeline statistics
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub enqueued: AtomicU64,
    pub applied: AtomicU64,
    pub rejected: AtomicU64,
    pub backpressure: AtomicU64,
    pub publishes: AtomicU64,
}

impl PipelineStats {
    fn processed(&self) -> u64 {
        self.applied.load(Ordering::SeqCst) + self.rejected.load(Ordering::SeqCst)
    }
}

pub struct TelemetryPipeline {
    engine: Arc<RiskEngine>,
    queues: DashMap<String, mpsc::Sender<TelemetrySample>>,
    dirty: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PipelineStats>,
}

impl std::fmt::Debug for TelemetryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPipeline")
            .field("queues", &self.queues.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl TelemetryPipeline {
    /// Start the publisher and staleness sweeper. Must be called inside a
    /// tokio runtime.
    pub fn start(engine: Arc<RiskEngine>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let pipeline = Arc::new(Self {
            engine,
            queues: DashMap::new(),
            dirty: Arc::new(Notify::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            stats: Arc::new(PipelineStats::default()),
        });

        let publisher = tokio::spawn(Self::run_publisher(
            pipeline.engine.clone(),
            pipeline.dirty.clone(),
            pipeline.stats.clone(),
            pipeline.shutdown.subscribe(),
        ));
        let sweeper = tokio::spawn(Self::run_sweeper(
            pipeline.engine.clone(),
            pipeline.dirty.clone(),
            pipeline.shutdown.subscribe(),
        ));
        pipeline.tasks.lock().extend([publisher, sweeper]);

        info!("Telemetry pipeline started");
        pipeline
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Enqueue a sample on its entity's queue. Waits at most the configured
    /// enqueue timeout for space, then reports backpressure. Samples for
    /// unknown entities are rejected immediately without creating a queue.
    pub async fn submit(&self, sample: TelemetrySample) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(StateError::PipelineClosed);
        }
        if !self.engine.knows_entity(&sample.entity_id) {
            self.stats.rejected.fetch_add(1, Ordering::SeqCst);
            self.stats.enqueued.fetch_add(1, Ordering::SeqCst);
            return self.engine.apply_sample(&sample).map(|_| ());
        }

        let sender = self.queue_for(&sample.entity_id);
        let entity = sample.entity_id.clone();
        let timeout = self.engine.config().ingest.enqueue_timeout;
        match sender.send_timeout(sample, timeout).await {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.stats.backpressure.fetch_add(1, Ordering::SeqCst);
                warn!(entity = %entity, "Telemetry queue full, sample not accepted");
                Err(StateError::Backpressure { entity })
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(StateError::PipelineClosed),
        }
    }

    fn queue_for(&self, entity_id: &str) -> mpsc::Sender<TelemetrySample> {
        if let Some(sender) = self.queues.get(entity_id) {
            return sender.clone();
        }

        self.queues
            .entry(entity_id.to_string())
            .or_insert_with(|| {
                let capacity = self.engine.config().ingest.queue_capacity;
                let (tx, rx) = mpsc::channel(capacity);
                let worker = tokio::spawn(Self::run_worker(
                    entity_id.to_string(),
                    rx,
                    self.engine.clone(),
                    self.dirty.clone(),
                    self.stats.clone(),
                ));
                self.tasks.lock().push(worker);
                debug!(entity = %entity_id, capacity, "Created telemetry queue");
                tx
            })
            .clone()
    }

    async fn run_worker(
        entity: String,
        mut rx: mpsc::Receiver<TelemetrySample>,
        engine: Arc<RiskEngine>,
        dirty: Arc<Notify>,
        stats: Arc<PipelineStats>,
    ) {
        while let Some(sample) = rx.recv().await {
            match engine.apply_sample(&sample) {
                Ok(_) => {
                    stats.applied.fetch_add(1, Ordering::SeqCst);
                    dirty.notify_one();
                }
                // already logged and counted by the engine
                Err(_) => {
                    stats.rejected.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        debug!(entity = %entity, "Telemetry worker stopped");
    }

    async fn run_publisher(
        engine: Arc<RiskEngine>,
        dirty: Arc<Notify>,
        stats: Arc<PipelineStats>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let debounce = engine.config().ingest.publish_debounce;
        loop {
            tokio::select! {
                _ = dirty.notified() => {
                    tokio::time::sleep(debounce).await;
                    engine.publish();
                    stats.publishes.fetch_add(1, Ordering::SeqCst);
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_sweeper(
        engine: Arc<RiskEngine>,
        dirty: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(engine.config().ingest.stale_sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if engine.mark_stale(Utc::now()) > 0 {
                        dirty.notify_one();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Forward every sample from `source` into the pipeline until the
    /// source finishes. Returns the number of samples accepted onto queues.
    pub async fn run_source(&self, source: Arc<dyn TelemetrySource>) -> Result<u64> {
        let capacity = self.engine.config().ingest.queue_capacity;
        let (tx, mut rx) = mpsc::channel(capacity);
        let name = source.name().to_string();
        let producer = tokio::spawn(async move { source.start(tx).await });

        let mut accepted = 0u64;
        while let Some(sample) = rx.recv().await {
            match self.submit(sample).await {
                Ok(()) => accepted += 1,
                Err(StateError::PipelineClosed) => break,
                Err(e) => debug!(source = %name, "Sample not accepted: {}", e),
            }
        }

        match producer.await {
            Ok(Ok(sent)) => info!(source = %name, sent, accepted, "Telemetry source finished"),
            Ok(Err(e)) => warn!(source = %name, "Telemetry source failed: {}", e),
            Err(e) => warn!(source = %name, "Telemetry source task panicked: {}", e),
        }
        Ok(accepted)
    }

    /// Wait until every enqueued sample has been applied or rejected, up to
    /// `timeout`. Returns whether the queues drained in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.stats.processed() >= self.stats.enqueued.load(Ordering::SeqCst) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Stop accepting samples, let workers finish their queues, stop the
    /// background tasks and publish a final snapshot.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.queues.clear();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Pipeline task ended abnormally: {}", e);
            }
        }

        let snapshot = self.engine.publish();
        info!(
            version = snapshot.version,
            applied = self.stats.applied.load(Ordering::SeqCst),
            rejected = self.stats.rejected.load(Ordering::SeqCst),
            "Telemetry pipeline stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use uponline_core::config::EngineConfig;
    use uponline_core::topology::Topology;
    use uponline_core::{MetricKind, RackId};

    const FLOOR: &str = r#"
racks:
  - { id: B3, row: B, position: 3, cooling_zone: Zone B, pdu: PDU-B3 }
  - { id: B4, row: B, position: 4, cooling_zone: Zone B, pdu: PDU-B4 }
cooling_zones:
  - name: Zone B
    crah_units:
      - { name: CRAH-3, rated_capacity_kw: 45.0, setpoint_c: 22.0 }
power_domains:
  - { id: PDU-B3, kind: Pdu, rated_capacity_kw: 20.0 }
  - { id: PDU-B4, kind: Pdu, rated_capacity_kw: 20.0 }
"#;

    fn engine(config: EngineConfig) -> Arc<RiskEngine> {
        Arc::new(RiskEngine::new(config, Topology::from_yaml_str(FLOOR).unwrap()).unwrap())
    }

    fn sample(entity: &str, value: f64, t: DateTime<Utc>) -> TelemetrySample {
        TelemetrySample::new(entity, MetricKind::InletTemperature, value, t)
    }

    #[tokio::test]
    async fn test_samples_are_applied_in_order_per_entity() {
        let engine = engine(EngineConfig::default());
        let pipeline = TelemetryPipeline::start(engine.clone());
        let base = Utc::now();

        for i in 0..20 {
            let t = base + ChronoDuration::seconds(i);
            pipeline.submit(sample("B3", 25.0 + i as f64 * 0.1, t)).await.unwrap();
            pipeline.submit(sample("B4", 30.0, t)).await.unwrap();
        }
        assert!(pipeline.drain(Duration::from_secs(5)).await);
        assert_eq!(pipeline.queue_count(), 2);
        assert_eq!(pipeline.stats().applied.load(Ordering::SeqCst), 40);
        assert_eq!(pipeline.stats().rejected.load(Ordering::SeqCst), 0);

        pipeline.shutdown().await;
        let snapshot = engine.store().latest().unwrap();
        let b3 = snapshot.rack(&RackId::new("B3")).unwrap();
        assert!((b3.inlet_c.unwrap() - 26.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_entity_rejected_without_queue() {
        let engine = engine(EngineConfig::default());
        let pipeline = TelemetryPipeline::start(engine.clone());

        let result = pipeline.submit(sample("Z9", 25.0, Utc::now())).await;
        assert!(matches!(result, Err(StateError::Core(_))));
        assert_eq!(pipeline.queue_count(), 0);
        assert!(pipeline.drain(Duration::from_secs(1)).await);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_publisher_coalesces_updates() {
        let engine = engine(EngineConfig::default());
        let pipeline = TelemetryPipeline::start(engine.clone());
        let base = Utc::now();

        for i in 0..10 {
            let t = base + ChronoDuration::seconds(i);
            pipeline.submit(sample("B3", 25.0, t)).await.unwrap();
        }
        assert!(pipeline.drain(Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let publishes = pipeline.stats().publishes.load(Ordering::SeqCst);
        assert!(publishes >= 1 && publishes < 10, "publishes {}", publishes);
        assert!(engine.store().latest().is_some());
        pipeline.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_queue_reports_backpressure() {
        let mut config = EngineConfig::default();
        config.ingest.queue_capacity = 1;
        config.ingest.enqueue_timeout = Duration::from_millis(20);
        let engine = engine(config);
        let pipeline = TelemetryPipeline::start(engine.clone());

        let (stalled_tx, stalled_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || {
                engine.with_writers_stalled(|| {
                    let _ = stalled_tx.send(());
                    let _ = release_rx.recv();
                })
            })
        };
        stalled_rx.await.unwrap();

        // the B3 worker blocks on its first sample and the queue holds one more
        let base = Utc::now();
        let mut outcomes = Vec::new();
        for i in 0..4 {
            let t = base + ChronoDuration::seconds(i);
            outcomes.push(pipeline.submit(sample("B3", 25.0, t)).await);
        }
        assert!(outcomes[0].is_ok());
        assert!(matches!(
            &outcomes[3],
            Err(StateError::Backpressure { entity }) if entity == "B3"
        ));
        let refused = outcomes.iter().filter(|o| o.is_err()).count() as u64;
        assert!(refused >= 2, "refused {}", refused);
        assert_eq!(pipeline.stats().backpressure.load(Ordering::SeqCst), refused);

        // other entities have their own queue
        pipeline.submit(sample("B4", 25.0, base)).await.unwrap();

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        assert!(pipeline.drain(Duration::from_secs(5)).await);
        assert_eq!(pipeline.stats().applied.load(Ordering::SeqCst), 4 - refused + 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let engine = engine(EngineConfig::default());
        let pipeline = TelemetryPipeline::start(engine);
        pipeline.shutdown().await;
        let result = pipeline.submit(sample("B3", 25.0, Utc::now())).await;
        assert!(matches!(result, Err(StateError::PipelineClosed)));
    }

    struct VecSource {
        samples: Vec<TelemetrySample>,
    }

    #[async_trait]
    impl TelemetrySource for VecSource {
        fn name(&self) -> &str {
            "vec"
        }

        async fn start(
            &self,
            sender: mpsc::Sender<TelemetrySample>,
        ) -> uponline_core::Result<u64> {
            let mut sent = 0;
            for sample in &self.samples {
                if sender.send(sample.clone()).await.is_err() {
                    break;
                }
                sent += 1;
            }
            Ok(sent)
        }

        async fn stop(&self) -> uponline_core::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_source() {
        let engine = engine(EngineConfig::default());
        let pipeline = TelemetryPipeline::start(engine.clone());
        let base = Utc::now();
        let source = Arc::new(VecSource {
            samples: vec![
                sample("B3", 31.0, base),
                sample("ghost", 31.0, base),
                sample("B4", 29.0, base),
            ],
        });

        let accepted = pipeline.run_source(source).await.unwrap();
        assert_eq!(accepted, 2);
        assert!(pipeline.drain(Duration::from_secs(5)).await);
        pipeline.shutdown().await;
        assert_eq!(engine.metrics().samples_accepted.get(), 2);
    }
}
