//! # State Store
//!
//! Durable keyed storage for worldline metadata, version history, the
//! relationship graph, and the bookkeeping that makes ingestion idempotent
//! and replayable (seen event ids, the event log, source cursors, the
//! rejection and anomaly journals).
//!
//! ## Storage Backends
//!
//! - `MemoryStore`: `BTreeMap`s (fast, volatile)
//! - `RedbStore`: redb embedded database (ACID, persistent)
//!
//! Every mutation goes through [`StateStore::commit`], which applies one
//! [`Commit`] atomically. Only the shard that owns a worldline ever builds
//! commits for it.

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::{
    Anomaly, ClassId, Entanglement, EventId, IngestedEvent, Phase, Rejection, RegistryError,
    RelType, SourceId, StateVersion, WorldlineEntry, WorldlineId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// =============================================================================
// COMMIT
// =============================================================================

/// Everything one processed event changes, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    /// The processed event: marked seen, appended to the event log and
    /// used to move its source cursor.
    pub event: Option<IngestedEvent>,
    /// Upserted worldline metadata and head. The class/phase index follows
    /// the head's current phase.
    pub entry: Option<WorldlineEntry>,
    /// Appended state version.
    pub version: Option<StateVersion>,
    /// Upserted edge, keyed by (source, rel type, target).
    pub edge: Option<Entanglement>,
    pub rejection: Option<Rejection>,
    pub anomaly: Option<Anomaly>,
}

impl Commit {
    /// Commit that only journals an anomaly.
    #[must_use]
    pub fn anomaly(anomaly: Anomaly) -> Self {
        Self {
            anomaly: Some(anomaly),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Record counts of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub worldlines: usize,
    pub versions: usize,
    pub edges: usize,
    pub events: usize,
}

impl StoreCounts {
    /// Sum two sets of counts.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            worldlines: self.worldlines.saturating_add(other.worldlines),
            versions: self.versions.saturating_add(other.versions),
            edges: self.edges.saturating_add(other.edges),
            events: self.events.saturating_add(other.events),
        }
    }
}

// =============================================================================
// STORE TRAIT
// =============================================================================

/// Storage interface shared by every backend.
///
/// Reads return owned values so backends that deserialize on access (redb)
/// and backends that hold values (memory) look the same.
pub trait StateStore: Send + Sync {
    fn get_entry(&self, id: &WorldlineId) -> Result<Option<WorldlineEntry>, RegistryError>;

    fn get_version(
        &self,
        id: &WorldlineId,
        sequence: u64,
    ) -> Result<Option<StateVersion>, RegistryError>;

    /// All versions of a worldline in sequence order.
    fn versions(&self, id: &WorldlineId) -> Result<Vec<StateVersion>, RegistryError>;

    fn get_edge(
        &self,
        source: &WorldlineId,
        rel_type: &RelType,
        target: &WorldlineId,
    ) -> Result<Option<Entanglement>, RegistryError>;

    /// Every edge originating at `source`, revoked ones included, ordered by
    /// (rel type, target).
    fn edges_from(&self, source: &WorldlineId) -> Result<Vec<Entanglement>, RegistryError>;

    fn has_seen(&self, event_id: &EventId) -> Result<bool, RegistryError>;

    /// Worldline ids whose current phase is `phase`, ascending, strictly
    /// after `after`, at most `limit`.
    fn find_by_class_and_phase(
        &self,
        class: &ClassId,
        phase: &Phase,
        after: Option<&WorldlineId>,
        limit: usize,
    ) -> Result<Vec<WorldlineId>, RegistryError>;

    /// Worldline entries in id order, strictly after `after`, at most `limit`.
    fn entries(
        &self,
        after: Option<&WorldlineId>,
        limit: usize,
    ) -> Result<Vec<WorldlineEntry>, RegistryError>;

    /// Logged events in (worldline, sequence) order, strictly after `after`,
    /// at most `limit`.
    fn logged_events(
        &self,
        after: Option<(&WorldlineId, u64)>,
        limit: usize,
    ) -> Result<Vec<IngestedEvent>, RegistryError>;

    fn rejections(&self) -> Result<Vec<Rejection>, RegistryError>;

    fn anomalies(&self) -> Result<Vec<Anomaly>, RegistryError>;

    /// Last processed sequence per worldline for one source.
    fn cursor(&self, source: &SourceId) -> Result<BTreeMap<WorldlineId, u64>, RegistryError>;

    fn counts(&self) -> Result<StoreCounts, RegistryError>;

    /// Apply a commit atomically.
    fn commit(&mut self, commit: Commit) -> Result<(), RegistryError>;
}

// =============================================================================
// BACKEND
// =============================================================================

/// Where shards keep their state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLayout {
    /// Volatile, one `MemoryStore` per shard.
    Memory,
    /// One redb file per shard under `dir` (`shard-0.redb`, ...).
    Redb { dir: PathBuf },
}

impl StoreLayout {
    /// Path of a shard's database file, for the redb layout.
    #[must_use]
    pub fn shard_path(dir: &Path, shard: usize) -> PathBuf {
        dir.join(format!("shard-{shard}.redb"))
    }

    /// Open the backend of one shard.
    pub fn open(&self, shard: usize) -> Result<Backend, RegistryError> {
        match self {
            Self::Memory => Ok(Backend::Memory(MemoryStore::new())),
            Self::Redb { dir } => {
                std::fs::create_dir_all(dir).map_err(|e| RegistryError::Io(e.to_string()))?;
                Ok(Backend::Redb(RedbStore::open(Self::shard_path(dir, shard))?))
            }
        }
    }
}

/// Storage backend of one shard.
#[derive(Debug)]
pub enum Backend {
    /// In-memory maps (fast, volatile).
    Memory(MemoryStore),
    /// Disk-backed store using redb (ACID, persistent).
    Redb(RedbStore),
}

impl Default for Backend {
    fn default() -> Self {
        Self::Memory(MemoryStore::new())
    }
}

impl Backend {
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Redb(_))
    }
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Backend::Memory($store) => $call,
            Backend::Redb($store) => $call,
        }
    };
}

impl StateStore for Backend {
    fn get_entry(&self, id: &WorldlineId) -> Result<Option<WorldlineEntry>, RegistryError> {
        dispatch!(self, s => s.get_entry(id))
    }

    fn get_version(
        &self,
        id: &WorldlineId,
        sequence: u64,
    ) -> Result<Option<StateVersion>, RegistryError> {
        dispatch!(self, s => s.get_version(id, sequence))
    }

    fn versions(&self, id: &WorldlineId) -> Result<Vec<StateVersion>, RegistryError> {
        dispatch!(self, s => s.versions(id))
    }

    fn get_edge(
        &self,
        source: &WorldlineId,
        rel_type: &RelType,
        target: &WorldlineId,
    ) -> Result<Option<Entanglement>, RegistryError> {
        dispatch!(self, s => s.get_edge(source, rel_type, target))
    }

    fn edges_from(&self, source: &WorldlineId) -> Result<Vec<Entanglement>, RegistryError> {
        dispatch!(self, s => s.edges_from(source))
    }

    fn has_seen(&self, event_id: &EventId) -> Result<bool, RegistryError> {
        dispatch!(self, s => s.has_seen(event_id))
    }

    fn find_by_class_and_phase(
        &self,
        class: &ClassId,
        phase: &Phase,
        after: Option<&WorldlineId>,
        limit: usize,
    ) -> Result<Vec<WorldlineId>, RegistryError> {
        dispatch!(self, s => s.find_by_class_and_phase(class, phase, after, limit))
    }

    fn entries(
        &self,
        after: Option<&WorldlineId>,
        limit: usize,
    ) -> Result<Vec<WorldlineEntry>, RegistryError> {
        dispatch!(self, s => s.entries(after, limit))
    }

    fn logged_events(
        &self,
        after: Option<(&WorldlineId, u64)>,
        limit: usize,
    ) -> Result<Vec<IngestedEvent>, RegistryError> {
        dispatch!(self, s => s.logged_events(after, limit))
    }

    fn rejections(&self) -> Result<Vec<Rejection>, RegistryError> {
        dispatch!(self, s => s.rejections())
    }

    fn anomalies(&self) -> Result<Vec<Anomaly>, RegistryError> {
        dispatch!(self, s => s.anomalies())
    }

    fn cursor(&self, source: &SourceId) -> Result<BTreeMap<WorldlineId, u64>, RegistryError> {
        dispatch!(self, s => s.cursor(source))
    }

    fn counts(&self) -> Result<StoreCounts, RegistryError> {
        dispatch!(self, s => s.counts())
    }

    fn commit(&mut self, commit: Commit) -> Result<(), RegistryError> {
        dispatch!(self, s => s.commit(commit))
    }
}
