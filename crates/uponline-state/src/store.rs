//! Versioned snapshot store
//!
//! Published snapshots are immutable and shared through `Arc`; the store
//! keeps the last few versions readable so a reader can pin a version for the
//! duration of a request. An optional key-value backend receives a JSON copy
//! of every published snapshot.

use crate::snapshot::Snapshot;
use crate::{Result, StateError};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Minimal key-value storage used for snapshot persistence
pub trait SnapshotBackend: Send + Sync + Debug {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> Result<bool>;
    fn keys(&self) -> Result<Vec<String>>;
}

/// In-process backend, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotBackend for MemoryBackend {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

/// One JSON file per key in a directory. `/` in keys is stored as `~`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('~') || key.contains("..") || key.contains('\\') {
            return Err(StateError::Store(format!("invalid backend key: {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key.replace('/', "~"))))
    }
}

impl SnapshotBackend for FileBackend {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<bool> {
        match std::fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                keys.push(stem.replace('~', "/"));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

const LATEST_KEY: &str = "snapshot/latest";

fn version_key(version: u64) -> String {
    format!("snapshot/{}", version)
}

/// Store statistics
#[derive(Debug, Default)]
pub struct StoreStats {
    pub published: AtomicU64,
    pub persist_failures: AtomicU64,
}

#[derive(Debug)]
pub struct SnapshotStore {
    history: RwLock<VecDeque<Arc<Snapshot>>>,
    capacity: usize,
    next_version: AtomicU64,
    backend: Option<Arc<dyn SnapshotBackend>>,
    stats: StoreStats,
}

impl SnapshotStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            next_version: AtomicU64::new(1),
            backend: None,
            stats: StoreStats::default(),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn SnapshotBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Assign the next version to `snapshot` and make it the latest.
    /// Persistence failures are logged and do not prevent publishing.
    pub fn publish(&self, mut snapshot: Snapshot) -> Arc<Snapshot> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        snapshot.version = version;
        let snapshot = Arc::new(snapshot);

        let evicted = {
            let mut history = self.history.write();
            history.push_back(snapshot.clone());
            let mut evicted = Vec::new();
            while history.len() > self.capacity {
                if let Some(old) = history.pop_front() {
                    evicted.push(old.version);
                }
            }
            evicted
        };

        if let Some(backend) = &self.backend {
            if let Err(e) = self.persist(backend.as_ref(), &snapshot, &evicted) {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(version, "Failed to persist snapshot: {}", e);
            }
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        debug!(version, evicted = evicted.len(), "Published snapshot");
        snapshot
    }

    fn persist(&self, backend: &dyn SnapshotBackend, snapshot: &Snapshot, evicted: &[u64]) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        backend.put(&version_key(snapshot.version), bytes.clone())?;
        backend.put(LATEST_KEY, bytes)?;
        for version in evicted {
            backend.delete(&version_key(*version))?;
        }
        Ok(())
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.history.read().back().cloned()
    }

    pub fn at_version(&self, version: u64) -> Option<Arc<Snapshot>> {
        self.history
            .read()
            .iter()
            .find(|s| s.version == version)
            .cloned()
    }

    /// Versions still readable, oldest first
    pub fn versions(&self) -> Vec<u64> {
        self.history.read().iter().map(|s| s.version).collect()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Read back the latest persisted snapshot. Topology is not persisted
    /// with it.
    pub fn load_latest(backend: &dyn SnapshotBackend) -> Result<Option<Snapshot>> {
        match backend.get(LATEST_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(topology_version: u64) -> Snapshot {
        Snapshot {
            topology_version,
            ..Default::default()
        }
    }

    #[test]
    fn test_versions_are_monotonic_and_bounded() {
        let store = SnapshotStore::new(3);
        assert!(store.latest().is_none());

        for _ in 0..5 {
            store.publish(snapshot(1));
        }
        assert_eq!(store.versions(), vec![3, 4, 5]);
        assert_eq!(store.latest().unwrap().version, 5);
        assert!(store.at_version(2).is_none());
        assert_eq!(store.at_version(4).unwrap().version, 4);
        assert_eq!(store.stats().published.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_readers_keep_pinned_version() {
        let store = SnapshotStore::new(2);
        let pinned = store.publish(snapshot(1));
        store.publish(snapshot(2));
        store.publish(snapshot(2));
        assert_eq!(pinned.version, 1);
        assert_eq!(pinned.topology_version, 1);
    }

    #[test]
    fn test_memory_backend_persistence() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SnapshotStore::new(2).with_backend(backend.clone());
        for _ in 0..3 {
            store.publish(snapshot(7));
        }

        assert_eq!(
            backend.keys().unwrap(),
            vec!["snapshot/2", "snapshot/3", "snapshot/latest"]
        );
        let latest = SnapshotStore::load_latest(backend.as_ref()).unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert_eq!(latest.topology_version, 7);
    }

    #[test]
    fn test_file_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("snapshots")).unwrap();

        backend.put("snapshot/1", b"{}".to_vec()).unwrap();
        assert_eq!(backend.get("snapshot/1").unwrap(), Some(b"{}".to_vec()));
        assert_eq!(backend.get("snapshot/9").unwrap(), None);
        assert_eq!(backend.keys().unwrap(), vec!["snapshot/1"]);
        assert!(backend.delete("snapshot/1").unwrap());
        assert!(!backend.delete("snapshot/1").unwrap());
        assert!(backend.put("../escape", vec![]).is_err());
    }

    #[test]
    fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::open(dir.path()).unwrap());
        let store = SnapshotStore::new(4).with_backend(backend.clone());
        store.publish(snapshot(3));

        let restored = SnapshotStore::load_latest(backend.as_ref()).unwrap().unwrap();
        assert_eq!(restored.version, 1);
        assert_eq!(restored.topology_version, 3);
    }
}
