//! Load-balancer persistence
//!
//! What a bundler learned about a node survives the node's connection: the
//! state is stored when the node leaves and restored when it comes back.
//! States are keyed by node and by algorithm id, a hash of the algorithm and
//! its profile, so a state learned under other parameters is never restored.
//!
//! [`FileLoadBalancerPersistence`] keeps one JSON file per node and algorithm
//! under a root directory. [`AsyncLoadBalancerPersistence`] wraps any other
//! persistence and writes stores behind the caller's back, on its own thread.

use crate::balancer::autotuned::SizeStats;
use crate::balancer::data_holder::BundleDataHolder;
use crate::balancer::profile::LoadBalancingProfile;
use crate::core::error::{Result, SerializationError};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Extension of stored state files
pub const STATE_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Learned state of one bundler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum BundlerState {
    /// Proportional bundler: its window and last computed share
    Proportional {
        /// Last good bundle size
        bundle_size: usize,
        /// Moving-average window
        data_holder: BundleDataHolder,
    },
    /// Step-search bundler
    Rl {
        /// Current bundle size
        bundle_size: usize,
        /// Last applied action
        action: i64,
        /// Moving-average window
        data_holder: BundleDataHolder,
    },
    /// Annealing bundler: the sizes tried so far
    Autotuned {
        /// Size being explored
        bundle_size: usize,
        /// Observed statistics per tried size, ascending
        samples: Vec<(usize, SizeStats)>,
    },
}

impl BundlerState {
    /// Algorithm that produced this state
    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Proportional { .. } => "proportional",
            Self::Rl { .. } => "rl",
            Self::Autotuned { .. } => "autotuned",
        }
    }

    /// Bundle size recorded in the state
    pub fn bundle_size(&self) -> usize {
        match self {
            Self::Proportional { bundle_size, .. }
            | Self::Rl { bundle_size, .. }
            | Self::Autotuned { bundle_size, .. } => *bundle_size,
        }
    }
}

/// Stable identifier of an algorithm and its parameters
pub fn algorithm_id(profile: &LoadBalancingProfile) -> String {
    let mut hasher = blake3::Hasher::new();
    match serde_json::to_vec(profile) {
        Ok(encoded) => hasher.update(&encoded),
        Err(_) => hasher.update(format!("{:?}", profile).as_bytes()),
    };
    hasher.finalize().to_hex().to_string()
}

/// Storage for bundler states.
///
/// In `delete` and `list`, a `None` node or algorithm matches every node or
/// every algorithm.
pub trait LoadBalancerPersistence: Send + Sync + fmt::Debug {
    /// State stored for `node` under `algorithm`, if any
    fn load(&self, node: &str, algorithm: &str) -> Result<Option<BundlerState>>;

    /// Store or replace the state of `node` under `algorithm`
    fn store(&self, node: &str, algorithm: &str, state: &BundlerState) -> Result<()>;

    /// Delete the matching states and return how many were removed
    fn delete(&self, node: Option<&str>, algorithm: Option<&str>) -> Result<usize>;

    /// Identifiers of the matching states, sorted.
    ///
    /// Without a node, the nodes holding a state for `algorithm` (or any
    /// state). With a node, the algorithms stored for it.
    fn list(&self, node: Option<&str>, algorithm: Option<&str>) -> Result<Vec<String>>;
}

/// One JSON file per node and algorithm: `<root>/<node>/<algorithm>.json`
#[derive(Debug, Clone)]
pub struct FileLoadBalancerPersistence {
    root: PathBuf,
}

impl FileLoadBalancerPersistence {
    /// Persistence rooted at `root`, created on the first store
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_dir(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    fn state_path(node_dir: &Path, algorithm: &str, extension: &str) -> PathBuf {
        node_dir.join(format!("{}.{}", algorithm, extension))
    }

    fn node_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }

    fn algorithms_in(node_dir: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(node_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut algorithms = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == STATE_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    algorithms.push(stem.to_string());
                }
            }
        }
        Ok(algorithms)
    }

    fn remove_if_empty(dir: &Path) -> Result<()> {
        if fs::read_dir(dir)?.next().is_none() {
            fs::remove_dir(dir)?;
        }
        Ok(())
    }

    fn file_name(path: &Path) -> Option<String> {
        path.file_name().and_then(|n| n.to_str()).map(str::to_string)
    }
}

impl LoadBalancerPersistence for FileLoadBalancerPersistence {
    fn load(&self, node: &str, algorithm: &str) -> Result<Option<BundlerState>> {
        let path = Self::state_path(&self.node_dir(node), algorithm, STATE_EXTENSION);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        debug!("Loading bundler state from {}", path.display());
        let state =
            serde_json::from_reader(BufReader::new(file)).map_err(SerializationError::from)?;
        Ok(Some(state))
    }

    fn store(&self, node: &str, algorithm: &str, state: &BundlerState) -> Result<()> {
        let dir = self.node_dir(node);
        fs::create_dir_all(&dir)?;
        let path = Self::state_path(&dir, algorithm, STATE_EXTENSION);
        let temp = Self::state_path(&dir, algorithm, TEMP_EXTENSION);
        debug!("Storing {} bundler state to {}", state.algorithm(), path.display());

        // readers only ever see a complete file
        {
            let mut writer = BufWriter::new(fs::File::create(&temp)?);
            serde_json::to_writer(&mut writer, state).map_err(SerializationError::from)?;
            writer.flush()?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn delete(&self, node: Option<&str>, algorithm: Option<&str>) -> Result<usize> {
        let dirs = match node {
            Some(node) => vec![self.node_dir(node)],
            None => self.node_dirs()?,
        };
        let mut deleted = 0;
        for dir in dirs {
            let algorithms = match algorithm {
                Some(algorithm) => vec![algorithm.to_string()],
                None => Self::algorithms_in(&dir)?,
            };
            for algorithm in algorithms {
                match fs::remove_file(Self::state_path(&dir, &algorithm, STATE_EXTENSION)) {
                    Ok(()) => deleted += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if dir.is_dir() {
                Self::remove_if_empty(&dir)?;
            }
        }
        debug!(
            "Deleted {} bundler states (node={:?}, algorithm={:?})",
            deleted, node, algorithm
        );
        Ok(deleted)
    }

    fn list(&self, node: Option<&str>, algorithm: Option<&str>) -> Result<Vec<String>> {
        let mut result: Vec<String> = match (node, algorithm) {
            (None, None) => self
                .node_dirs()?
                .iter()
                .filter_map(|dir| Self::file_name(dir))
                .collect(),
            (None, Some(algorithm)) => self
                .node_dirs()?
                .iter()
                .filter(|dir| Self::state_path(dir, algorithm, STATE_EXTENSION).is_file())
                .filter_map(|dir| Self::file_name(dir))
                .collect(),
            (Some(node), None) => Self::algorithms_in(&self.node_dir(node))?,
            (Some(node), Some(algorithm)) => {
                let path = Self::state_path(&self.node_dir(node), algorithm, STATE_EXTENSION);
                if path.is_file() {
                    vec![algorithm.to_string()]
                } else {
                    Vec::new()
                }
            }
        };
        result.sort();
        trace!("Listed {:?} (node={:?}, algorithm={:?})", result, node, algorithm);
        Ok(result)
    }
}

/// In-memory persistence, lost with the process
#[derive(Debug, Default)]
pub struct MemoryLoadBalancerPersistence {
    states: DashMap<(String, String), BundlerState>,
}

impl MemoryLoadBalancerPersistence {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored states
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

fn matches_key(key: &(String, String), node: Option<&str>, algorithm: Option<&str>) -> bool {
    node.map_or(true, |n| key.0 == n) && algorithm.map_or(true, |a| key.1 == a)
}

impl LoadBalancerPersistence for MemoryLoadBalancerPersistence {
    fn load(&self, node: &str, algorithm: &str) -> Result<Option<BundlerState>> {
        Ok(self
            .states
            .get(&(node.to_string(), algorithm.to_string()))
            .map(|state| state.clone()))
    }

    fn store(&self, node: &str, algorithm: &str, state: &BundlerState) -> Result<()> {
        self.states
            .insert((node.to_string(), algorithm.to_string()), state.clone());
        Ok(())
    }

    fn delete(&self, node: Option<&str>, algorithm: Option<&str>) -> Result<usize> {
        let before = self.states.len();
        self.states.retain(|key, _| !matches_key(key, node, algorithm));
        Ok(before.saturating_sub(self.states.len()))
    }

    fn list(&self, node: Option<&str>, algorithm: Option<&str>) -> Result<Vec<String>> {
        let mut result: Vec<String> = self
            .states
            .iter()
            .filter(|entry| matches_key(entry.key(), node, algorithm))
            .map(|entry| match node {
                Some(_) => entry.key().1.clone(),
                None => entry.key().0.clone(),
            })
            .collect();
        result.sort();
        result.dedup();
        Ok(result)
    }
}

type PendingStores = HashMap<(String, String), BundlerState>;

#[derive(Debug, Default)]
struct WriteBehind {
    /// Stores not yet written, and the shutdown flag
    pending: Mutex<(PendingStores, bool)>,
    wakeup: Condvar,
    /// Held from taking a batch until it is written
    writing: Mutex<()>,
}

impl WriteBehind {
    fn write_batch(&self, delegate: &dyn LoadBalancerPersistence) -> Result<()> {
        let _writing = self.writing.lock();
        let batch = std::mem::take(&mut self.pending.lock().0);
        for ((node, algorithm), state) in batch {
            delegate.store(&node, &algorithm, &state)?;
        }
        Ok(())
    }
}

/// Write-behind wrapper: `store` returns at once and a background thread
/// hands the state to the delegate. A newer state for the same node and
/// algorithm replaces one not written yet. Loads and listings see pending
/// stores.
pub struct AsyncLoadBalancerPersistence {
    delegate: Arc<dyn LoadBalancerPersistence>,
    shared: Arc<WriteBehind>,
    writer: Option<JoinHandle<()>>,
}

impl AsyncLoadBalancerPersistence {
    /// Wrap `delegate`, starting the writer thread
    pub fn new(delegate: Arc<dyn LoadBalancerPersistence>) -> Result<Self> {
        let shared = Arc::new(WriteBehind::default());
        let writer = {
            let shared = shared.clone();
            let delegate = delegate.clone();
            std::thread::Builder::new()
                .name("lb-persistence".to_string())
                .spawn(move || write_pending(&shared, delegate.as_ref()))?
        };
        Ok(Self {
            delegate,
            shared,
            writer: Some(writer),
        })
    }

    /// Number of stores not yet handed to the delegate
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().0.len()
    }

    /// Write every pending store now, on the calling thread
    pub fn flush(&self) -> Result<()> {
        self.shared.write_batch(self.delegate.as_ref())
    }
}

fn write_pending(shared: &WriteBehind, delegate: &dyn LoadBalancerPersistence) {
    loop {
        let shutdown = {
            let mut guard = shared.pending.lock();
            while guard.0.is_empty() && !guard.1 {
                shared.wakeup.wait(&mut guard);
            }
            guard.1
        };
        if let Err(e) = shared.write_batch(delegate) {
            warn!("Failed to store bundler states: {}", e);
        }
        if shutdown {
            return;
        }
    }
}

impl LoadBalancerPersistence for AsyncLoadBalancerPersistence {
    fn load(&self, node: &str, algorithm: &str) -> Result<Option<BundlerState>> {
        let key = (node.to_string(), algorithm.to_string());
        if let Some(state) = self.shared.pending.lock().0.get(&key) {
            return Ok(Some(state.clone()));
        }
        self.delegate.load(node, algorithm)
    }

    fn store(&self, node: &str, algorithm: &str, state: &BundlerState) -> Result<()> {
        let mut guard = self.shared.pending.lock();
        guard
            .0
            .insert((node.to_string(), algorithm.to_string()), state.clone());
        self.shared.wakeup.notify_one();
        Ok(())
    }

    fn delete(&self, node: Option<&str>, algorithm: Option<&str>) -> Result<usize> {
        // no batch can be half written while matching states are removed
        let _writing = self.shared.writing.lock();
        let dropped = {
            let mut guard = self.shared.pending.lock();
            let before = guard.0.len();
            guard.0.retain(|key, _| !matches_key(key, node, algorithm));
            before - guard.0.len()
        };
        let deleted = self.delegate.delete(node, algorithm)?;
        Ok(deleted.max(dropped))
    }

    fn list(&self, node: Option<&str>, algorithm: Option<&str>) -> Result<Vec<String>> {
        self.flush()?;
        self.delegate.list(node, algorithm)
    }
}

impl fmt::Debug for AsyncLoadBalancerPersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLoadBalancerPersistence")
            .field("delegate", &self.delegate)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for AsyncLoadBalancerPersistence {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.pending.lock();
            guard.1 = true;
            self.shared.wakeup.notify_one();
        }
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("Load-balancer persistence writer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::profile::{ProportionalProfile, RlProfile};
    use crate::balancer::sample::PerformanceSample;

    fn proportional_state(size: usize) -> BundlerState {
        let mut data_holder = BundleDataHolder::new(100).with_bundle_size(size);
        data_holder.add_sample(PerformanceSample::from_total(10, 25.0).unwrap());
        BundlerState::Proportional {
            bundle_size: size,
            data_holder,
        }
    }

    fn rl_state(size: usize) -> BundlerState {
        BundlerState::Rl {
            bundle_size: size,
            action: -3,
            data_holder: BundleDataHolder::new(20),
        }
    }

    #[test]
    fn test_algorithm_id_tracks_profile() {
        let default = LoadBalancingProfile::Proportional(ProportionalProfile::default());
        let sharper = LoadBalancingProfile::Proportional(ProportionalProfile {
            proportionality_factor: 3.0,
            ..ProportionalProfile::default()
        });
        let rl = LoadBalancingProfile::Rl(RlProfile::default());

        assert_eq!(algorithm_id(&default), algorithm_id(&default.clone()));
        assert_ne!(algorithm_id(&default), algorithm_id(&sharper));
        assert_ne!(algorithm_id(&default), algorithm_id(&rl));
        assert_eq!(algorithm_id(&rl).len(), 64);
    }

    #[test]
    fn test_file_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = FileLoadBalancerPersistence::new(dir.path().join("lb"));
        assert_eq!(persistence.load("node-1", "algo").unwrap(), None);

        let state = proportional_state(42);
        persistence.store("node-1", "algo", &state).unwrap();
        assert_eq!(persistence.load("node-1", "algo").unwrap(), Some(state));

        // replaced in place, no temporary file left behind
        persistence.store("node-1", "algo", &rl_state(7)).unwrap();
        assert_eq!(persistence.load("node-1", "algo").unwrap(), Some(rl_state(7)));
        let files: Vec<_> = fs::read_dir(dir.path().join("lb").join("node-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("algo.json")]);
    }

    #[test]
    fn test_file_corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = FileLoadBalancerPersistence::new(dir.path());
        fs::create_dir_all(dir.path().join("node-1")).unwrap();
        fs::write(dir.path().join("node-1").join("algo.json"), b"{ not json").unwrap();

        assert!(matches!(
            persistence.load("node-1", "algo"),
            Err(crate::core::Error::Serialization(SerializationError::Json(_)))
        ));
    }

    #[test]
    fn test_file_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = FileLoadBalancerPersistence::new(dir.path());
        assert!(persistence.list(None, None).unwrap().is_empty());

        persistence.store("n1", "a1", &proportional_state(1)).unwrap();
        persistence.store("n1", "a2", &proportional_state(2)).unwrap();
        persistence.store("n2", "a1", &rl_state(3)).unwrap();
        persistence.store("n3", "a2", &rl_state(4)).unwrap();

        assert_eq!(persistence.list(None, None).unwrap(), vec!["n1", "n2", "n3"]);
        assert_eq!(persistence.list(Some("n1"), None).unwrap(), vec!["a1", "a2"]);
        assert_eq!(persistence.list(None, Some("a1")).unwrap(), vec!["n1", "n2"]);
        assert_eq!(persistence.list(Some("n3"), Some("a1")).unwrap(), Vec::<String>::new());
        assert_eq!(persistence.list(Some("n3"), Some("a2")).unwrap(), vec!["a2"]);

        // one algorithm across every node; emptied node directories go away
        assert_eq!(persistence.delete(None, Some("a1")).unwrap(), 2);
        assert_eq!(persistence.list(None, None).unwrap(), vec!["n1", "n3"]);
        assert!(!dir.path().join("n2").exists());

        assert_eq!(persistence.delete(Some("n1"), Some("a2")).unwrap(), 1);
        assert_eq!(persistence.delete(Some("missing"), None).unwrap(), 0);
        assert_eq!(persistence.delete(None, None).unwrap(), 1);
        assert!(persistence.list(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_memory_list_and_delete() {
        let persistence = MemoryLoadBalancerPersistence::new();
        persistence.store("n1", "a1", &proportional_state(1)).unwrap();
        persistence.store("n1", "a2", &proportional_state(2)).unwrap();
        persistence.store("n2", "a1", &rl_state(3)).unwrap();

        assert_eq!(persistence.list(None, None).unwrap(), vec!["n1", "n2"]);
        assert_eq!(persistence.list(Some("n1"), None).unwrap(), vec!["a1", "a2"]);
        assert_eq!(persistence.list(None, Some("a2")).unwrap(), vec!["n1"]);

        assert_eq!(persistence.delete(Some("n1"), None).unwrap(), 2);
        assert_eq!(persistence.len(), 1);
        assert_eq!(persistence.load("n2", "a1").unwrap(), Some(rl_state(3)));
    }

    #[test]
    fn test_async_store_reaches_delegate() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(FileLoadBalancerPersistence::new(dir.path()));
        let persistence = AsyncLoadBalancerPersistence::new(files.clone()).unwrap();

        persistence.store("n1", "a1", &proportional_state(5)).unwrap();
        // pending or written, the state is visible
        assert_eq!(persistence.load("n1", "a1").unwrap(), Some(proportional_state(5)));
        assert_eq!(persistence.list(Some("n1"), None).unwrap(), vec!["a1"]);

        drop(persistence);
        assert_eq!(files.load("n1", "a1").unwrap(), Some(proportional_state(5)));
    }

    #[test]
    fn test_async_delete_drops_pending_store() {
        let memory = Arc::new(MemoryLoadBalancerPersistence::new());
        let persistence = AsyncLoadBalancerPersistence::new(memory.clone()).unwrap();
        persistence.store("n1", "a1", &rl_state(2)).unwrap();

        assert_eq!(persistence.delete(Some("n1"), None).unwrap(), 1);
        assert_eq!(persistence.pending(), 0);
        drop(persistence);
        assert!(memory.is_empty());
    }
}
