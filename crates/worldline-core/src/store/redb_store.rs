//! # redb-backed State Store
//!
//! A disk-backed store using the redb embedded database: ACID write
//! transactions, crash safety through copy-on-write B-trees, and MVCC so
//! readers never block the shard's single writer.
//!
//! Records are serialized with postcard. Composite keys are redb tuples so
//! per-worldline scans are range reads.

use super::{Commit, StateStore, StoreCounts};
use crate::{
    Anomaly, ClassId, Entanglement, EventId, IngestedEvent, Phase, Rejection, RegistryError,
    RelType, SourceId, StateVersion, WorldlineEntry, WorldlineId,
};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

/// Table for worldlines: worldline id -> serialized `WorldlineEntry`
const WORLDLINES: TableDefinition<&str, &[u8]> = TableDefinition::new("worldlines");

/// Table for versions: (worldline id, sequence) -> serialized `StateVersion`
const VERSIONS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("versions");

/// Table for edges: (source, rel type, target) -> serialized `Entanglement`
const EDGES: TableDefinition<(&str, &str, &str), &[u8]> = TableDefinition::new("edges");

/// Table for the class/phase index: (class, current phase, worldline id)
const PHASE_INDEX: TableDefinition<(&str, &str, &str), ()> = TableDefinition::new("phase_index");

/// Table for processed event ids: event id -> sequence
const SEEN: TableDefinition<&str, u64> = TableDefinition::new("seen");

/// Table for the event log: (worldline id, sequence) -> serialized `IngestedEvent`
const EVENT_LOG: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("event_log");

/// Table for rejections: event id -> serialized `Rejection`
const REJECTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("rejections");

/// Table for anomalies: journal position -> serialized `Anomaly`
const ANOMALIES: TableDefinition<u64, &[u8]> = TableDefinition::new("anomalies");

/// Table for source cursors: (source, worldline id) -> last sequence
const CURSORS: TableDefinition<(&str, &str), u64> = TableDefinition::new("cursors");

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RegistryError> {
    postcard::to_allocvec(value).map_err(RegistryError::codec)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RegistryError> {
    postcard::from_bytes(bytes).map_err(RegistryError::codec)
}

/// A disk-backed state store using redb.
pub struct RedbStore {
    db: Database,
    /// Next free anomaly journal position.
    next_anomaly: u64,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("next_anomaly", &self.next_anomaly)
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let db = Database::create(path.as_ref()).map_err(RegistryError::store)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(RegistryError::store)?;
            let _ = write_txn.open_table(WORLDLINES).map_err(RegistryError::store)?;
            let _ = write_txn.open_table(VERSIONS).map_err(RegistryError::store)?;
            let _ = write_txn.open_table(EDGES).map_err(RegistryError::store)?;
            let _ = write_txn.open_table(PHASE_INDEX).map_err(RegistryError::store)?;
            let _ = write_txn.open_table(SEEN).map_err(RegistryError::store)?;
            let _ = write_txn.open_table(EVENT_LOG).map_err(RegistryError::store)?;
            let _ = write_txn.open_table(REJECTIONS).map_err(RegistryError::store)?;
            let _ = write_txn.open_table(ANOMALIES).map_err(RegistryError::store)?;
            let _ = write_txn.open_table(CURSORS).map_err(RegistryError::store)?;
            write_txn.commit().map_err(RegistryError::store)?;
        }

        let next_anomaly = {
            let read_txn = db.begin_read().map_err(RegistryError::store)?;
            let table = read_txn.open_table(ANOMALIES).map_err(RegistryError::store)?;
            table
                .last()
                .map_err(RegistryError::store)?
                .map(|(k, _)| k.value().saturating_add(1))
                .unwrap_or(0)
        };

        Ok(Self { db, next_anomaly })
    }

    /// Compact the database file.
    pub fn compact(&mut self) -> Result<(), RegistryError> {
        self.db.compact().map_err(RegistryError::store)?;
        Ok(())
    }

    fn read_value<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(table).map_err(RegistryError::store)?;
        match table.get(key).map_err(RegistryError::store)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// STATESTORE TRAIT IMPLEMENTATION
// =============================================================================

impl StateStore for RedbStore {
    fn get_entry(&self, id: &WorldlineId) -> Result<Option<WorldlineEntry>, RegistryError> {
        self.read_value(WORLDLINES, id.as_str())
    }

    fn get_version(
        &self,
        id: &WorldlineId,
        sequence: u64,
    ) -> Result<Option<StateVersion>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(VERSIONS).map_err(RegistryError::store)?;
        match table
            .get((id.as_str(), sequence))
            .map_err(RegistryError::store)?
        {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn versions(&self, id: &WorldlineId) -> Result<Vec<StateVersion>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(VERSIONS).map_err(RegistryError::store)?;

        let mut versions = Vec::new();
        for entry in table
            .range((id.as_str(), 0u64)..=(id.as_str(), u64::MAX))
            .map_err(RegistryError::store)?
        {
            let (_, value) = entry.map_err(RegistryError::store)?;
            versions.push(decode(value.value())?);
        }
        Ok(versions)
    }

    fn get_edge(
        &self,
        source: &WorldlineId,
        rel_type: &RelType,
        target: &WorldlineId,
    ) -> Result<Option<Entanglement>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(EDGES).map_err(RegistryError::store)?;
        match table
            .get((source.as_str(), rel_type.as_str(), target.as_str()))
            .map_err(RegistryError::store)?
        {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn edges_from(&self, source: &WorldlineId) -> Result<Vec<Entanglement>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(EDGES).map_err(RegistryError::store)?;

        let mut edges = Vec::new();
        for entry in table
            .range((source.as_str(), "", "")..)
            .map_err(RegistryError::store)?
        {
            let (key, value) = entry.map_err(RegistryError::store)?;
            if key.value().0 != source.as_str() {
                break;
            }
            edges.push(decode(value.value())?);
        }
        Ok(edges)
    }

    fn has_seen(&self, event_id: &EventId) -> Result<bool, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(SEEN).map_err(RegistryError::store)?;
        Ok(table
            .get(event_id.as_str())
            .map_err(RegistryError::store)?
            .is_some())
    }

    fn find_by_class_and_phase(
        &self,
        class: &ClassId,
        phase: &Phase,
        after: Option<&WorldlineId>,
        limit: usize,
    ) -> Result<Vec<WorldlineId>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn
            .open_table(PHASE_INDEX)
            .map_err(RegistryError::store)?;

        let start = match after {
            Some(id) => Bound::Excluded((class.as_str(), phase.as_str(), id.as_str())),
            None => Bound::Included((class.as_str(), phase.as_str(), "")),
        };
        let mut ids = Vec::new();
        for entry in table
            .range((start, Bound::Unbounded))
            .map_err(RegistryError::store)?
        {
            if ids.len() >= limit {
                break;
            }
            let (key, _) = entry.map_err(RegistryError::store)?;
            let (c, p, id) = key.value();
            if c != class.as_str() || p != phase.as_str() {
                break;
            }
            ids.push(WorldlineId::from(id));
        }
        Ok(ids)
    }

    fn entries(
        &self,
        after: Option<&WorldlineId>,
        limit: usize,
    ) -> Result<Vec<WorldlineEntry>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(WORLDLINES).map_err(RegistryError::store)?;

        let start = after.map_or(Bound::Unbounded, |id| Bound::Excluded(id.as_str()));
        let mut entries = Vec::new();
        for entry in table
            .range::<&str>((start, Bound::Unbounded))
            .map_err(RegistryError::store)?
        {
            if entries.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(RegistryError::store)?;
            entries.push(decode(value.value())?);
        }
        Ok(entries)
    }

    fn logged_events(
        &self,
        after: Option<(&WorldlineId, u64)>,
        limit: usize,
    ) -> Result<Vec<IngestedEvent>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(EVENT_LOG).map_err(RegistryError::store)?;

        let start = after.map_or(Bound::Unbounded, |(id, seq)| {
            Bound::Excluded((id.as_str(), seq))
        });
        let mut events = Vec::new();
        for entry in table
            .range((start, Bound::Unbounded))
            .map_err(RegistryError::store)?
        {
            if events.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(RegistryError::store)?;
            events.push(decode(value.value())?);
        }
        Ok(events)
    }

    fn rejections(&self) -> Result<Vec<Rejection>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(REJECTIONS).map_err(RegistryError::store)?;

        let mut rejections = Vec::new();
        for entry in table.iter().map_err(RegistryError::store)? {
            let (_, value) = entry.map_err(RegistryError::store)?;
            rejections.push(decode(value.value())?);
        }
        Ok(rejections)
    }

    fn anomalies(&self) -> Result<Vec<Anomaly>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(ANOMALIES).map_err(RegistryError::store)?;

        let mut anomalies = Vec::new();
        for entry in table.iter().map_err(RegistryError::store)? {
            let (_, value) = entry.map_err(RegistryError::store)?;
            anomalies.push(decode(value.value())?);
        }
        Ok(anomalies)
    }

    fn cursor(&self, source: &SourceId) -> Result<BTreeMap<WorldlineId, u64>, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let table = read_txn.open_table(CURSORS).map_err(RegistryError::store)?;

        let mut cursor = BTreeMap::new();
        for entry in table
            .range((source.as_str(), "")..)
            .map_err(RegistryError::store)?
        {
            let (key, value) = entry.map_err(RegistryError::store)?;
            let (s, wl) = key.value();
            if s != source.as_str() {
                break;
            }
            cursor.insert(WorldlineId::from(wl), value.value());
        }
        Ok(cursor)
    }

    fn counts(&self) -> Result<StoreCounts, RegistryError> {
        let read_txn = self.db.begin_read().map_err(RegistryError::store)?;
        let len = |n: u64| usize::try_from(n).unwrap_or(usize::MAX);
        Ok(StoreCounts {
            worldlines: len(
                read_txn
                    .open_table(WORLDLINES)
                    .map_err(RegistryError::store)?
                    .len()
                    .map_err(RegistryError::store)?,
            ),
            versions: len(
                read_txn
                    .open_table(VERSIONS)
                    .map_err(RegistryError::store)?
                    .len()
                    .map_err(RegistryError::store)?,
            ),
            edges: len(
                read_txn
                    .open_table(EDGES)
                    .map_err(RegistryError::store)?
                    .len()
                    .map_err(RegistryError::store)?,
            ),
            events: len(
                read_txn
                    .open_table(EVENT_LOG)
                    .map_err(RegistryError::store)?
                    .len()
                    .map_err(RegistryError::store)?,
            ),
        })
    }

    fn commit(&mut self, commit: Commit) -> Result<(), RegistryError> {
        // Serialize everything up front so a codec failure never leaves a
        // half-written transaction behind.
        let event_bytes = commit.event.as_ref().map(encode).transpose()?;
        let entry_bytes = commit.entry.as_ref().map(encode).transpose()?;
        let version_bytes = commit.version.as_ref().map(encode).transpose()?;
        let edge_bytes = commit.edge.as_ref().map(encode).transpose()?;
        let rejection_bytes = commit.rejection.as_ref().map(encode).transpose()?;
        let anomaly_bytes = commit.anomaly.as_ref().map(encode).transpose()?;

        let write_txn = self.db.begin_write().map_err(RegistryError::store)?;
        {
            if let (Some(event), Some(bytes)) = (&commit.event, &event_bytes) {
                let wl = event.worldline.as_str();
                let mut seen = write_txn.open_table(SEEN).map_err(RegistryError::store)?;
                seen.insert(event.event_id.as_str(), event.sequence())
                    .map_err(RegistryError::store)?;
                let mut log = write_txn
                    .open_table(EVENT_LOG)
                    .map_err(RegistryError::store)?;
                log.insert((wl, event.sequence()), bytes.as_slice())
                    .map_err(RegistryError::store)?;
                let mut cursors = write_txn.open_table(CURSORS).map_err(RegistryError::store)?;
                cursors
                    .insert((event.ordering.source.as_str(), wl), event.sequence())
                    .map_err(RegistryError::store)?;
            }

            if let (Some(entry), Some(bytes)) = (&commit.entry, &entry_bytes) {
                let id = entry.worldline.id.as_str();
                let mut worldlines = write_txn
                    .open_table(WORLDLINES)
                    .map_err(RegistryError::store)?;
                let previous: Option<WorldlineEntry> = match worldlines
                    .get(id)
                    .map_err(RegistryError::store)?
                {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
                worldlines
                    .insert(id, bytes.as_slice())
                    .map_err(RegistryError::store)?;

                let mut index = write_txn
                    .open_table(PHASE_INDEX)
                    .map_err(RegistryError::store)?;
                if let Some(prev) = previous {
                    index
                        .remove((
                            prev.worldline.class.as_str(),
                            prev.head.current_phase.as_str(),
                            id,
                        ))
                        .map_err(RegistryError::store)?;
                }
                index
                    .insert(
                        (
                            entry.worldline.class.as_str(),
                            entry.head.current_phase.as_str(),
                            id,
                        ),
                        (),
                    )
                    .map_err(RegistryError::store)?;
            }

            if let (Some(version), Some(bytes)) = (&commit.version, &version_bytes) {
                let mut versions = write_txn.open_table(VERSIONS).map_err(RegistryError::store)?;
                versions
                    .insert(
                        (version.worldline.as_str(), version.sequence),
                        bytes.as_slice(),
                    )
                    .map_err(RegistryError::store)?;
            }

            if let (Some(edge), Some(bytes)) = (&commit.edge, &edge_bytes) {
                let mut edges = write_txn.open_table(EDGES).map_err(RegistryError::store)?;
                edges
                    .insert(
                        (
                            edge.source.as_str(),
                            edge.rel_type.as_str(),
                            edge.target.as_str(),
                        ),
                        bytes.as_slice(),
                    )
                    .map_err(RegistryError::store)?;
            }

            if let (Some(rejection), Some(bytes)) = (&commit.rejection, &rejection_bytes) {
                let mut rejections = write_txn
                    .open_table(REJECTIONS)
                    .map_err(RegistryError::store)?;
                rejections
                    .insert(rejection.event_id.as_str(), bytes.as_slice())
                    .map_err(RegistryError::store)?;
            }

            if let Some(bytes) = &anomaly_bytes {
                let mut anomalies = write_txn
                    .open_table(ANOMALIES)
                    .map_err(RegistryError::store)?;
                anomalies
                    .insert(self.next_anomaly, bytes.as_slice())
                    .map_err(RegistryError::store)?;
            }
        }
        write_txn.commit().map_err(RegistryError::store)?;

        // Update in-memory state only after successful commit.
        if anomaly_bytes.is_some() {
            self.next_anomaly = self.next_anomaly.saturating_add(1);
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
