//! Read API over published snapshots
//!
//! Every call binds to one snapshot version and has no side effects beyond
//! query counters. Collaborators that need several reads to agree pin a
//! snapshot with [`QueryEngine::pinned`] and read from it directly.

use crate::snapshot::{ActiveRisk, ClusterView, FleetSummary, JobView, RackView, Snapshot};
use crate::store::SnapshotStore;
use crate::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uponline_core::{ClusterId, JobId, JobStatus, RackId, RiskLevel, RiskSeverity};

/// Query statistics
#[derive(Debug, Default)]
pub struct QueryStats {
    pub total_queries: AtomicU64,
    pub not_found: AtomicU64,
}

/// Filter for job listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub cluster: Option<ClusterId>,
    pub status: Option<JobStatus>,
    pub min_infra_risk: Option<RiskLevel>,
}

impl JobFilter {
    fn matches(&self, job: &JobView) -> bool {
        self.cluster.as_ref().map_or(true, |c| &job.cluster == c)
            && self.status.map_or(true, |s| job.status == s)
            && self.min_infra_risk.map_or(true, |r| job.infra_risk >= r)
    }
}

#[derive(Debug)]
pub struct QueryEngine {
    store: Arc<SnapshotStore>,
    stats: QueryStats,
}

impl QueryEngine {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self {
            store,
            stats: QueryStats::default(),
        }
    }

    /// The latest snapshot, for callers that need several consistent reads
    pub fn pinned(&self) -> Result<Arc<Snapshot>> {
        self.store.latest().ok_or(StateError::NoSnapshot)
    }

    /// A specific retained snapshot version
    pub fn at_version(&self, version: u64) -> Result<Arc<Snapshot>> {
        self.store
            .at_version(version)
            .ok_or_else(|| StateError::NotFound(format!("snapshot version {}", version)))
    }

    fn lookup<T: Clone>(
        &self,
        what: impl FnOnce() -> String,
        find: impl FnOnce(&Snapshot) -> Option<&T>,
    ) -> Result<T> {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.pinned()?;
        match find(&snapshot) {
            Some(found) => Ok(found.clone()),
            None => {
                self.stats.not_found.fetch_add(1, Ordering::Relaxed);
                Err(StateError::NotFound(what()))
            }
        }
    }

    pub fn get_rack(&self, id: &RackId) -> Result<RackView> {
        self.lookup(|| format!("rack {}", id), |s| s.rack(id))
    }

    pub fn get_cluster(&self, name: &ClusterId) -> Result<ClusterView> {
        self.lookup(|| format!("cluster {}", name), |s| s.cluster(name))
    }

    pub fn get_job(&self, name: &JobId) -> Result<JobView> {
        self.lookup(|| format!("job {}", name), |s| s.job(name))
    }

    /// Active risks at or above `min_severity`, highest score first
    pub fn list_active_risks(&self, min_severity: RiskSeverity) -> Result<Vec<ActiveRisk>> {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.pinned()?;
        Ok(snapshot
            .risks_at_least(min_severity)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn list_racks(&self) -> Result<Vec<RackView>> {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.pinned()?.racks.values().cloned().collect())
    }

    pub fn list_clusters(&self) -> Result<Vec<ClusterView>> {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.pinned()?.clusters.values().cloned().collect())
    }

    /// Jobs matching `filter`, worst slowdown first
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobView>> {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.pinned()?;
        let mut jobs: Vec<JobView> = snapshot
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.slowdown_pct
                .total_cmp(&a.slowdown_pct)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(jobs)
    }

    pub fn fleet_summary(&self) -> Result<FleetSummary> {
        Ok(self.pinned()?.summary.clone())
    }

    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }
}
