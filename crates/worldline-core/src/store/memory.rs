//! In-memory state store.

use super::{Commit, StateStore, StoreCounts};
use crate::{
    Anomaly, ClassId, Entanglement, EventId, IngestedEvent, Phase, Rejection, RegistryError,
    RelType, SourceId, StateVersion, WorldlineEntry, WorldlineId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

type EdgeKey = (WorldlineId, RelType, WorldlineId);
type IndexKey = (ClassId, Phase, WorldlineId);

/// `BTreeMap`-backed store. Iteration order is always deterministic.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<WorldlineId, WorldlineEntry>,
    versions: BTreeMap<(WorldlineId, u64), StateVersion>,
    edges: BTreeMap<EdgeKey, Entanglement>,
    phase_index: BTreeSet<IndexKey>,
    seen: BTreeSet<EventId>,
    log: BTreeMap<(WorldlineId, u64), IngestedEvent>,
    rejections: BTreeMap<EventId, Rejection>,
    anomalies: Vec<Anomaly>,
    cursors: BTreeMap<(SourceId, WorldlineId), u64>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn index_key(entry: &WorldlineEntry) -> IndexKey {
        (
            entry.worldline.class.clone(),
            entry.head.current_phase.clone(),
            entry.worldline.id.clone(),
        )
    }
}

impl StateStore for MemoryStore {
    fn get_entry(&self, id: &WorldlineId) -> Result<Option<WorldlineEntry>, RegistryError> {
        Ok(self.entries.get(id).cloned())
    }

    fn get_version(
        &self,
        id: &WorldlineId,
        sequence: u64,
    ) -> Result<Option<StateVersion>, RegistryError> {
        Ok(self.versions.get(&(id.clone(), sequence)).cloned())
    }

    fn versions(&self, id: &WorldlineId) -> Result<Vec<StateVersion>, RegistryError> {
        Ok(self
            .versions
            .range((id.clone(), 0)..=(id.clone(), u64::MAX))
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn get_edge(
        &self,
        source: &WorldlineId,
        rel_type: &RelType,
        target: &WorldlineId,
    ) -> Result<Option<Entanglement>, RegistryError> {
        Ok(self
            .edges
            .get(&(source.clone(), rel_type.clone(), target.clone()))
            .cloned())
    }

    fn edges_from(&self, source: &WorldlineId) -> Result<Vec<Entanglement>, RegistryError> {
        let start = (source.clone(), RelType::default(), WorldlineId::default());
        Ok(self
            .edges
            .range(start..)
            .take_while(|((s, _, _), _)| s == source)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn has_seen(&self, event_id: &EventId) -> Result<bool, RegistryError> {
        Ok(self.seen.contains(event_id))
    }

    fn find_by_class_and_phase(
        &self,
        class: &ClassId,
        phase: &Phase,
        after: Option<&WorldlineId>,
        limit: usize,
    ) -> Result<Vec<WorldlineId>, RegistryError> {
        let start = match after {
            Some(id) => Bound::Excluded((class.clone(), phase.clone(), id.clone())),
            None => Bound::Included((class.clone(), phase.clone(), WorldlineId::default())),
        };
        Ok(self
            .phase_index
            .range((start, Bound::Unbounded))
            .take_while(|(c, p, _)| c == class && p == phase)
            .take(limit)
            .map(|(_, _, id)| id.clone())
            .collect())
    }

    fn entries(
        &self,
        after: Option<&WorldlineId>,
        limit: usize,
    ) -> Result<Vec<WorldlineEntry>, RegistryError> {
        let start = after.map_or(Bound::Unbounded, |id| Bound::Excluded(id.clone()));
        Ok(self
            .entries
            .range((start, Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn logged_events(
        &self,
        after: Option<(&WorldlineId, u64)>,
        limit: usize,
    ) -> Result<Vec<IngestedEvent>, RegistryError> {
        let start = after.map_or(Bound::Unbounded, |(id, seq)| {
            Bound::Excluded((id.clone(), seq))
        });
        Ok(self
            .log
            .range((start, Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn rejections(&self) -> Result<Vec<Rejection>, RegistryError> {
        Ok(self.rejections.values().cloned().collect())
    }

    fn anomalies(&self) -> Result<Vec<Anomaly>, RegistryError> {
        Ok(self.anomalies.clone())
    }

    fn cursor(&self, source: &SourceId) -> Result<BTreeMap<WorldlineId, u64>, RegistryError> {
        Ok(self
            .cursors
            .range((source.clone(), WorldlineId::default())..)
            .take_while(|((s, _), _)| s == source)
            .map(|((_, wl), seq)| (wl.clone(), *seq))
            .collect())
    }

    fn counts(&self) -> Result<StoreCounts, RegistryError> {
        Ok(StoreCounts {
            worldlines: self.entries.len(),
            versions: self.versions.len(),
            edges: self.edges.len(),
            events: self.log.len(),
        })
    }

    fn commit(&mut self, commit: Commit) -> Result<(), RegistryError> {
        // Nothing here can fail, so applying in sequence is atomic.
        if let Some(event) = commit.event {
            let key = (event.worldline.clone(), event.sequence());
            self.seen.insert(event.event_id.clone());
            self.cursors.insert(
                (event.ordering.source.clone(), event.worldline.clone()),
                event.sequence(),
            );
            self.log.insert(key, event);
        }
        if let Some(entry) = commit.entry {
            if let Some(previous) = self.entries.get(&entry.worldline.id) {
                self.phase_index.remove(&Self::index_key(previous));
            }
            self.phase_index.insert(Self::index_key(&entry));
            self.entries.insert(entry.worldline.id.clone(), entry);
        }
        if let Some(version) = commit.version {
            self.versions
                .insert((version.worldline.clone(), version.sequence), version);
        }
        if let Some(edge) = commit.edge {
            self.edges.insert(
                (edge.source.clone(), edge.rel_type.clone(), edge.target.clone()),
                edge,
            );
        }
        if let Some(rejection) = commit.rejection {
            self.rejections.insert(rejection.event_id.clone(), rejection);
        }
        if let Some(anomaly) = commit.anomaly {
            self.anomalies.push(anomaly);
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
