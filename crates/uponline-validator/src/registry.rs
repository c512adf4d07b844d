//! Change request registry
//!
//! The registry publishes its contents as an immutable [`ScheduleView`]. A
//! writer builds the next view from a copy and swaps it in only if the record
//! it changed still has the revision it read; otherwise it re-reads and tries
//! again. Readers, including the scheduling-conflict check, hold one view for
//! their whole evaluation.

use crate::change::{ChangeId, ChangeRequest};
use crate::{Result, ValidatorError};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Immutable view of every known change request
#[derive(Debug, Clone, Default)]
pub struct ScheduleView {
    /// Bumped on every commit
    pub version: u64,
    /// Bumped only when the set of window-reserving requests changes
    pub reservations: u64,
    pub requests: BTreeMap<ChangeId, ChangeRequest>,
}

impl ScheduleView {
    pub fn get(&self, id: &ChangeId) -> Option<&ChangeRequest> {
        self.requests.get(id)
    }

    /// Requests currently holding their window, excluding `except`
    pub fn reserving(&self, except: &ChangeId) -> impl Iterator<Item = &ChangeRequest> {
        let except = except.clone();
        self.requests
            .values()
            .filter(move |r| r.id != except && r.state.reserves_window())
    }
}

/// What a commit expects to still hold when it swaps the view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitGuard {
    pub revision: u64,
    /// Reservation generation the commit's scheduling decision was made on
    pub reservations: Option<u64>,
}

impl CommitGuard {
    pub fn revision(revision: u64) -> Self {
        Self {
            revision,
            reservations: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RegistryStats {
    pub commits: AtomicU64,
    pub conflicts: AtomicU64,
}

#[derive(Debug)]
pub struct ChangeRegistry {
    view: RwLock<Arc<ScheduleView>>,
    commit_lock: Mutex<()>,
    max_retries: u32,
    stats: RegistryStats,
}

impl ChangeRegistry {
    pub fn new(max_retries: u32) -> Self {
        Self {
            view: RwLock::new(Arc::new(ScheduleView::default())),
            commit_lock: Mutex::new(()),
            max_retries: max_retries.max(1),
            stats: RegistryStats::default(),
        }
    }

    pub fn view(&self) -> Arc<ScheduleView> {
        self.view.read().clone()
    }

    pub fn get(&self, id: &ChangeId) -> Result<ChangeRequest> {
        self.view()
            .get(id)
            .cloned()
            .ok_or_else(|| ValidatorError::NotFound(format!("change request {}", id)))
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Add a new request. Its id must be unused.
    pub fn insert(&self, request: ChangeRequest) -> Result<ChangeRequest> {
        let _commit = self.commit_lock.lock();
        let current = self.view();
        if current.requests.contains_key(&request.id) {
            return Err(ValidatorError::InvalidRequest(format!(
                "change request {} already exists",
                request.id
            )));
        }

        let mut next = (*current).clone();
        next.version += 1;
        next.requests.insert(request.id.clone(), request.clone());
        *self.view.write() = Arc::new(next);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(request)
    }

    /// Replace a request if `guard` still holds. The stored copy gets the
    /// next revision.
    pub fn commit(&self, mut request: ChangeRequest, guard: CommitGuard) -> Result<ChangeRequest> {
        let _commit = self.commit_lock.lock();
        let current = self.view();
        let existing = current
            .get(&request.id)
            .ok_or_else(|| ValidatorError::NotFound(format!("change request {}", request.id)))?;

        let stale_reservations = guard
            .reservations
            .map_or(false, |seen| seen != current.reservations);
        if existing.revision != guard.revision || stale_reservations {
            self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(
                id = %request.id,
                expected = guard.revision,
                found = existing.revision,
                "Change request commit lost a race"
            );
            return Err(ValidatorError::ConcurrentModification(request.id.to_string()));
        }

        let reservation_changed = existing.state.reserves_window()
            != request.state.reserves_window()
            || (request.state.reserves_window() && existing.spec.window != request.spec.window);

        request.revision = existing.revision + 1;
        let mut next = (*current).clone();
        next.version += 1;
        if reservation_changed {
            next.reservations += 1;
        }
        next.requests.insert(request.id.clone(), request.clone());
        *self.view.write() = Arc::new(next);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(request)
    }

    /// Read-modify-write of one request. `apply` returns `Ok(None)` to leave
    /// the request untouched. Lost races are retried against the latest view.
    pub fn update<F>(&self, id: &ChangeId, mut apply: F) -> Result<ChangeRequest>
    where
        F: FnMut(&ChangeRequest) -> Result<Option<ChangeRequest>>,
    {
        for _ in 0..self.max_retries {
            let current = self.get(id)?;
            let next = match apply(&current)? {
                Some(next) => next,
                None => return Ok(current),
            };
            match self.commit(next, CommitGuard::revision(current.revision)) {
                Err(e) if e.is_retryable() => continue,
                other => return other,
            }
        }
        Err(ValidatorError::ConcurrentModification(id.to_string()))
    }
}
