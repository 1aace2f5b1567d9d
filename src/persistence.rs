//! Persisted id sets (encountered and vouched issues).
//!
//! The on-disk format is a JSON array of id strings in insertion order,
//! e.g. `["17", "42", "a9f3"]`. A set is loaded once at start-up, mutated in
//! memory and written back after every change; there is a single writer, so
//! the last write wins.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::issues::IssueId;

/// Opaque get/set of a serialized id list.
pub trait IdStore: Send + Sync {
    fn load(&self) -> Result<Vec<IssueId>>;
    fn save(&self, ids: &[IssueId]) -> Result<()>;
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<app data dir>/<name>.json`
    pub fn in_app_dir(name: &str) -> Self {
        Self::new(crate::utils::app_data_dir().join(format!("{name}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdStore for JsonFileStore {
    fn load(&self) -> Result<Vec<IssueId>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let ids = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(ids)
    }

    fn save(&self, ids: &[IssueId]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::utils::ensure_dir(parent)?;
        }
        let data = serde_json::to_vec(ids)?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

/// In-memory store, shared through clones.
#[derive(Clone, Default)]
pub struct MemoryStore {
    ids: Arc<Mutex<Vec<IssueId>>>,
}

impl MemoryStore {
    pub fn with_ids(ids: Vec<IssueId>) -> Self {
        Self {
            ids: Arc::new(Mutex::new(ids)),
        }
    }

    pub fn snapshot(&self) -> Vec<IssueId> {
        self.ids.lock().map(|ids| ids.clone()).unwrap_or_default()
    }
}

impl IdStore for MemoryStore {
    fn load(&self) -> Result<Vec<IssueId>> {
        Ok(self.snapshot())
    }

    fn save(&self, ids: &[IssueId]) -> Result<()> {
        let mut stored = self
            .ids
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        *stored = ids.to_vec();
        Ok(())
    }
}

/// Insertion-ordered id set with write-through persistence.
pub struct PersistedIdSet {
    order: Vec<IssueId>,
    members: HashSet<IssueId>,
    store: Box<dyn IdStore>,
}

impl PersistedIdSet {
    /// Loads the stored ids. An unreadable store starts the set empty.
    pub fn load(store: Box<dyn IdStore>) -> Self {
        let stored = store.load().unwrap_or_else(|e| {
            warn!("Could not load persisted ids: {:#}. Starting empty.", e);
            Vec::new()
        });

        let mut set = Self {
            order: Vec::with_capacity(stored.len()),
            members: HashSet::with_capacity(stored.len()),
            store,
        };
        for id in stored {
            if set.members.insert(id.clone()) {
                set.order.push(id);
            }
        }
        debug!("Loaded {} persisted ids", set.order.len());
        set
    }

    pub fn contains(&self, id: &IssueId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn ids(&self) -> &[IssueId] {
        &self.order
    }

    /// Returns `true` if the id was new. Persists only on change.
    pub fn insert(&mut self, id: IssueId) -> bool {
        self.extend(std::iter::once(id)) == 1
    }

    /// Inserts every new id and persists once. Returns how many were new.
    pub fn extend(&mut self, ids: impl IntoIterator<Item = IssueId>) -> usize {
        let mut added = 0;
        for id in ids {
            if self.members.insert(id.clone()) {
                self.order.push(id);
                added += 1;
            }
        }
        if added > 0 {
            self.persist();
        }
        added
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.order) {
            warn!("Failed to persist id set: {:#}", e);
        }
    }
}

/// Issues the user has vouched for on this device.
pub struct VouchLedger {
    ids: PersistedIdSet,
}

impl VouchLedger {
    pub fn load(store: Box<dyn IdStore>) -> Self {
        Self {
            ids: PersistedIdSet::load(store),
        }
    }

    /// Records a vouch. Returns `false` if this issue was already vouched for.
    pub fn record_vouch(&mut self, id: IssueId) -> bool {
        let added = self.ids.insert(id.clone());
        if added {
            info!("Vouched for issue {}", id);
        }
        added
    }

    pub fn has_vouched(&self, id: &IssueId) -> bool {
        self.ids.contains(id)
    }

    pub fn vouched(&self) -> &[IssueId] {
        self.ids.ids()
    }
}
