//! # Query Module
//!
//! Read-only access to the registry.
//!
//! - Point lookups: current state, history, neighbors, class policy
//! - Index scans by class and phase, paged and restartable
//! - Attribute range scans over current versions
//! - Operator views: rejections, anomalies, source cursors, counters
//!
//! Each call reads a shard under one read guard, so a result never mixes
//! two commits of the same shard. Shards are read one at a time and no lock
//! spans shards.

use crate::policy::{ClassPolicy, ClassPolicyStore};
use crate::primitives::{DEFAULT_SCAN_PAGE, MAX_SCAN_PAGE};
use crate::registry::ShardRouter;
use crate::shard::{ShardReader, ShardStats};
use crate::store::{StateStore, StoreCounts};
use crate::{
    Anomaly, ClassId, CurrentState, Entanglement, Phase, RegistryError, Rejection, RelType,
    SourceId, StateVersion, WorldlineEntry, WorldlineId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

// =============================================================================
// RESULT TYPES
// =============================================================================

/// One page of a class/phase scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<WorldlineId>,
    /// Pass as `after` to fetch the next page. `None` when exhausted.
    pub next: Option<WorldlineId>,
}

/// A worldline whose current version holds an attribute inside a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMatch {
    pub worldline: WorldlineId,
    pub value: i64,
    pub sequence: u64,
}

/// Counts and counters of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSummary {
    pub index: usize,
    pub counts: StoreCounts,
    pub counters: ShardStats,
}

/// Counts and counters over every shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub shards: usize,
    pub counts: StoreCounts,
    pub counters: ShardStats,
    pub per_shard: Vec<ShardSummary>,
}

// =============================================================================
// QUERY SERVICE
// =============================================================================

/// Cheap to clone; every clone reads the same shards.
#[derive(Clone)]
pub struct QueryService {
    readers: Arc<[ShardReader]>,
    router: ShardRouter,
    policies: Arc<dyn ClassPolicyStore>,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("shards", &self.readers.len())
            .finish_non_exhaustive()
    }
}

impl QueryService {
    #[must_use]
    pub fn new(
        readers: Vec<ShardReader>,
        router: ShardRouter,
        policies: Arc<dyn ClassPolicyStore>,
    ) -> Self {
        Self {
            readers: readers.into(),
            router,
            policies,
        }
    }

    pub(crate) fn readers(&self) -> &[ShardReader] {
        &self.readers
    }

    fn reader_for(&self, id: &WorldlineId) -> &ShardReader {
        &self.readers[self.router.route(id)]
    }

    /// Worldline metadata and head.
    pub fn get_entry(&self, id: &WorldlineId) -> Result<WorldlineEntry, RegistryError> {
        self.reader_for(id)
            .store()
            .get_entry(id)?
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Latest verified version plus the degraded flag.
    pub fn get_current(&self, id: &WorldlineId) -> Result<CurrentState, RegistryError> {
        let store = self.reader_for(id).store();
        let entry = store
            .get_entry(id)?
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let version = store
            .get_version(id, entry.head.current_version)?
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        Ok(CurrentState {
            degraded: entry.head.is_degraded(),
            worldline: entry.worldline,
            version,
        })
    }

    /// Every version in sequence order, mismatched and unresolved included.
    pub fn get_history(&self, id: &WorldlineId) -> Result<Vec<StateVersion>, RegistryError> {
        let store = self.reader_for(id).store();
        if store.get_entry(id)?.is_none() {
            return Err(RegistryError::NotFound(id.clone()));
        }
        store.versions(id)
    }

    /// Active outgoing edges, optionally of one relationship type.
    pub fn get_neighbors(
        &self,
        id: &WorldlineId,
        rel_type: Option<&RelType>,
    ) -> Result<Vec<Entanglement>, RegistryError> {
        let store = self.reader_for(id).store();
        if store.get_entry(id)?.is_none() {
            return Err(RegistryError::NotFound(id.clone()));
        }
        Ok(store
            .edges_from(id)?
            .into_iter()
            .filter(Entanglement::is_active)
            .filter(|e| rel_type.is_none_or(|rel| &e.rel_type == rel))
            .collect())
    }

    /// One page of worldlines of `class` currently in `phase`, in id order.
    ///
    /// Each shard contributes at most `limit` ids past `after`; the merged
    /// list is cut to `limit`, so the page is exact.
    pub fn find_by_class_and_phase(
        &self,
        class: &ClassId,
        phase: &Phase,
        after: Option<&WorldlineId>,
        limit: usize,
    ) -> Result<Page, RegistryError> {
        let limit = limit.clamp(1, MAX_SCAN_PAGE);
        let mut items = Vec::new();
        for reader in self.readers.iter() {
            items.extend(
                reader
                    .store()
                    .find_by_class_and_phase(class, phase, after, limit)?,
            );
        }
        items.sort();
        items.truncate(limit);
        let next = if items.len() == limit {
            items.last().cloned()
        } else {
            None
        };
        Ok(Page { items, next })
    }

    /// Lazy scan over a class/phase index. See [`PhaseScan`].
    #[must_use]
    pub fn scan_class_and_phase(&self, class: ClassId, phase: Phase) -> PhaseScan {
        PhaseScan {
            service: self.clone(),
            class,
            phase,
            after: None,
            page: VecDeque::new(),
            exhausted: false,
            page_size: DEFAULT_SCAN_PAGE,
        }
    }

    /// Worldlines of `class` whose current version has `attribute` in
    /// `[min, max]`, in id order.
    pub fn find_by_attribute_range(
        &self,
        class: &ClassId,
        attribute: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<AttributeMatch>, RegistryError> {
        let mut matches = Vec::new();
        for reader in self.readers.iter() {
            let store = reader.store();
            let mut after: Option<WorldlineId> = None;
            loop {
                let entries = store.entries(after.as_ref(), DEFAULT_SCAN_PAGE)?;
                let Some(last) = entries.last() else { break };
                after = Some(last.worldline.id.clone());
                let full = entries.len() == DEFAULT_SCAN_PAGE;

                for entry in entries.iter().filter(|e| &e.worldline.class == class) {
                    let id = &entry.worldline.id;
                    let Some(version) = store.get_version(id, entry.head.current_version)? else {
                        continue;
                    };
                    if let Some(&value) = version.frequency.get(attribute) {
                        if (min..=max).contains(&value) {
                            matches.push(AttributeMatch {
                                worldline: id.clone(),
                                value,
                                sequence: version.sequence,
                            });
                        }
                    }
                }
                if !full {
                    break;
                }
            }
        }
        matches.sort_by(|a, b| a.worldline.cmp(&b.worldline));
        Ok(matches)
    }

    /// Policy of a class.
    #[must_use]
    pub fn get_class(&self, class: &ClassId) -> Option<ClassPolicy> {
        self.policies.get_class(class).cloned()
    }

    /// Journaled rejections of every shard, ordered by event timestamp.
    pub fn rejections(&self) -> Result<Vec<Rejection>, RegistryError> {
        let mut all = Vec::new();
        for reader in self.readers.iter() {
            all.extend(reader.store().rejections()?);
        }
        all.sort_by(|a, b| {
            (a.timestamp, &a.worldline, a.ordering.sequence).cmp(&(
                b.timestamp,
                &b.worldline,
                b.ordering.sequence,
            ))
        });
        Ok(all)
    }

    /// Journaled anomalies of every shard, ordered by when they were seen.
    pub fn anomalies(&self) -> Result<Vec<Anomaly>, RegistryError> {
        let mut all = Vec::new();
        for reader in self.readers.iter() {
            all.extend(reader.store().anomalies()?);
        }
        all.sort_by_key(|a| a.observed_at);
        Ok(all)
    }

    /// Last processed sequence per worldline for one source.
    pub fn cursor(&self, source: &SourceId) -> Result<BTreeMap<WorldlineId, u64>, RegistryError> {
        let mut cursor = BTreeMap::new();
        for reader in self.readers.iter() {
            cursor.extend(reader.store().cursor(source)?);
        }
        Ok(cursor)
    }

    pub fn stats(&self) -> Result<RegistryStats, RegistryError> {
        let mut per_shard = Vec::with_capacity(self.readers.len());
        for reader in self.readers.iter() {
            per_shard.push(ShardSummary {
                index: reader.index(),
                counts: reader.store().counts()?,
                counters: reader.stats(),
            });
        }
        let counts = per_shard
            .iter()
            .fold(StoreCounts::default(), |acc, s| acc.merge(s.counts));
        let counters = per_shard
            .iter()
            .fold(ShardStats::default(), |acc, s| acc.merge(s.counters));
        Ok(RegistryStats {
            shards: self.readers.len(),
            counts,
            counters,
            per_shard,
        })
    }
}

// =============================================================================
// LAZY SCAN
// =============================================================================

/// Iterator over a class/phase index, fetched one page at a time.
///
/// Restartable: record [`PhaseScan::position`] and later continue with
/// [`PhaseScan::resume_after`]. Ids that change phase during a scan may be
/// missed or seen; each page on its own is consistent.
#[derive(Debug)]
pub struct PhaseScan {
    service: QueryService,
    class: ClassId,
    phase: Phase,
    after: Option<WorldlineId>,
    page: VecDeque<WorldlineId>,
    exhausted: bool,
    page_size: usize,
}

impl PhaseScan {
    /// Continue strictly after `id`.
    #[must_use]
    pub fn resume_after(mut self, id: WorldlineId) -> Self {
        self.after = Some(id);
        self.page.clear();
        self.exhausted = false;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_SCAN_PAGE);
        self
    }

    /// Last id handed out, if any.
    #[must_use]
    pub fn position(&self) -> Option<&WorldlineId> {
        self.after.as_ref()
    }

    fn refill(&mut self) -> Result<(), RegistryError> {
        let page = self.service.find_by_class_and_phase(
            &self.class,
            &self.phase,
            self.after.as_ref(),
            self.page_size,
        )?;
        self.exhausted = page.next.is_none();
        self.page.extend(page.items);
        Ok(())
    }
}

impl Iterator for PhaseScan {
    type Item = Result<WorldlineId, RegistryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let id = self.page.pop_front()?;
        self.after = Some(id.clone());
        Some(Ok(id))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::blob::{BlobResolver, MemoryBlobStore};
    use crate::policy::PolicyTable;
    use crate::registry::Registry;
    use crate::shard::{GapPolicy, ShardConfig};
    use crate::{EventPayload, FieldMask, IngestedEvent, OrderingKey};

    fn registry() -> (Registry, Arc<MemoryBlobStore>) {
        let policies = PolicyTable::from_policies([ClassPolicy::new(
            "GOLD_VAULT",
            ["ORIGINATED", "ONCHAIN_ACTIVE"],
        )
        .with_transition("ORIGINATED", "ONCHAIN_ACTIVE")
        .with_rel_type("COLLATERAL_FOR")])
        .unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let registry = Registry::in_memory(
            3,
            policies,
            BlobResolver::in_memory(Arc::clone(&blobs)),
            ShardConfig::new(GapPolicy::Hold),
        )
        .unwrap();
        (registry, blobs)
    }

    fn create(registry: &mut Registry, n: usize) -> Vec<WorldlineId> {
        (0..n)
            .map(|i| {
                let event = IngestedEvent::create(
                    format!("c-{i}"),
                    "ledger",
                    1,
                    "GOLD_VAULT",
                    format!("SKR-{i:03}"),
                    "0,0",
                );
                let id = event.worldline.clone();
                registry.ingest(event, 0);
                id
            })
            .collect()
    }

    fn update(id: &WorldlineId, seq: u64, event_id: &str, payload: EventPayload) -> IngestedEvent {
        IngestedEvent {
            event_id: event_id.into(),
            worldline: id.clone(),
            ordering: OrderingKey::new("ledger", seq),
            timestamp: seq,
            payload,
        }
    }

    #[test]
    fn missing_worldline_is_not_found() {
        let (registry, _) = registry();
        let id = WorldlineId::from("wl-missing");
        let q = registry.query();
        assert!(matches!(q.get_current(&id), Err(RegistryError::NotFound(_))));
        assert!(matches!(q.get_history(&id), Err(RegistryError::NotFound(_))));
        assert!(matches!(
            q.get_neighbors(&id, None),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn pages_are_exact_across_shards() {
        let (mut registry, _) = registry();
        let mut ids = create(&mut registry, 10);
        ids.sort();
        let q = registry.query();
        let class = ClassId::from("GOLD_VAULT");
        let phase = Phase::from("ORIGINATED");

        let first = q.find_by_class_and_phase(&class, &phase, None, 4).unwrap();
        assert_eq!(first.items, ids[..4]);
        let second = q
            .find_by_class_and_phase(&class, &phase, first.next.as_ref(), 4)
            .unwrap();
        assert_eq!(second.items, ids[4..8]);
        let third = q
            .find_by_class_and_phase(&class, &phase, second.next.as_ref(), 4)
            .unwrap();
        assert_eq!(third.items, ids[8..]);
        assert!(third.next.is_none());
    }

    #[test]
    fn lazy_scan_restarts_from_position() {
        let (mut registry, _) = registry();
        let mut ids = create(&mut registry, 7);
        ids.sort();
        let q = registry.query();

        let mut scan = q
            .scan_class_and_phase("GOLD_VAULT".into(), "ORIGINATED".into())
            .with_page_size(2);
        let head: Vec<WorldlineId> = scan.by_ref().take(3).map(Result::unwrap).collect();
        assert_eq!(head, ids[..3]);
        let position = scan.position().cloned().unwrap();

        let rest: Vec<WorldlineId> = q
            .scan_class_and_phase("GOLD_VAULT".into(), "ORIGINATED".into())
            .resume_after(position)
            .map(Result::unwrap)
            .collect();
        assert_eq!(rest, ids[3..]);
    }

    #[test]
    fn phase_change_moves_index_entry() {
        let (mut registry, _) = registry();
        let ids = create(&mut registry, 2);
        let payload = EventPayload::UpdateState {
            mask: FieldMask::phase_only(),
            blob: None,
            phase: Some("ONCHAIN_ACTIVE".into()),
        };
        registry.ingest(update(&ids[0], 1, "u-1", payload), 0);

        let q = registry.query();
        let class = ClassId::from("GOLD_VAULT");
        let active = q
            .find_by_class_and_phase(&class, &"ONCHAIN_ACTIVE".into(), None, 10)
            .unwrap();
        assert_eq!(active.items, vec![ids[0].clone()]);
        let originated = q
            .find_by_class_and_phase(&class, &"ORIGINATED".into(), None, 10)
            .unwrap();
        assert_eq!(originated.items, vec![ids[1].clone()]);
    }

    #[test]
    fn attribute_range_reads_current_versions() {
        let (mut registry, blobs) = registry();
        let ids = create(&mut registry, 3);
        for (i, id) in ids.iter().enumerate() {
            let blob = blobs.put_content(
                format!(r#"{{"frequency":{{"grams":{}}}}}"#, (i as i64 + 1) * 500).into_bytes(),
            );
            let payload = EventPayload::UpdateState {
                mask: FieldMask::payload(),
                blob: Some(blob),
                phase: None,
            };
            registry.ingest(update(id, 1, &format!("b-{i}"), payload), 0);
        }

        let found = registry
            .query()
            .find_by_attribute_range(&"GOLD_VAULT".into(), "grams", 600, 1500)
            .unwrap();
        let values: Vec<i64> = found.iter().map(|m| m.value).collect();
        let mut expected = vec![1000, 1500];
        expected.sort_by_key(|v| {
            let index = (*v / 500 - 1) as usize;
            ids[index].clone()
        });
        assert_eq!(values, expected);
    }

    #[test]
    fn neighbors_filter_by_rel_type_and_skip_revoked() {
        let (mut registry, _) = registry();
        let ids = create(&mut registry, 1);
        let id = &ids[0];
        let rel = RelType::from("COLLATERAL_FOR");
        for (seq, target) in [(1, "wl-a"), (2, "wl-b")] {
            let payload = EventPayload::Entangle {
                rel_type: rel.clone(),
                target: target.into(),
            };
            registry.ingest(update(id, seq, &format!("e-{seq}"), payload), 0);
        }
        let payload = EventPayload::Revoke {
            rel_type: rel.clone(),
            target: "wl-a".into(),
        };
        registry.ingest(update(id, 3, "r-3", payload), 0);

        let q = registry.query();
        let active = q.get_neighbors(id, Some(&rel)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].target, WorldlineId::from("wl-b"));
        assert!(q.get_neighbors(id, Some(&"OTHER".into())).unwrap().is_empty());
    }

    #[test]
    fn class_lookup() {
        let (registry, _) = registry();
        let q = registry.query();
        assert!(q.get_class(&"GOLD_VAULT".into()).is_some());
        assert!(q.get_class(&"SILVER".into()).is_none());
    }
}
