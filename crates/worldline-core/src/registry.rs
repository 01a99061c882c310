//! # Registry
//!
//! The assembled write path: an [`Ingestor`] in front of a fixed set of
//! shards, plus the [`QueryService`] reading from them.
//!
//! `Registry` drives every shard from the calling thread, which is what
//! tests, replay and the CLI want. A server takes the pieces apart with
//! [`Registry::into_parts`] and gives each shard its own worker thread; the
//! routing is the same either way.

use crate::blob::BlobResolver;
use crate::ingestor::Ingestor;
use crate::policy::{ClassPolicyStore, PolicyTable};
use crate::primitives::MAX_SHARD_COUNT;
use crate::query::QueryService;
use crate::shard::{IngestOutcome, Shard, ShardConfig, TickReport};
use crate::store::StoreLayout;
use crate::{IngestedEvent, RegistryError, SourceId, WorldlineId};
use std::sync::Arc;

// =============================================================================
// ROUTING
// =============================================================================

/// Maps a worldline to the shard that owns it.
///
/// The hash is BLAKE3 over the id bytes, so placement is stable across
/// processes and platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shards: usize,
}

impl ShardRouter {
    pub fn new(shards: usize) -> Result<Self, RegistryError> {
        if shards == 0 || shards > MAX_SHARD_COUNT {
            return Err(RegistryError::Config(format!(
                "shard count must be between 1 and {MAX_SHARD_COUNT}, got {shards}"
            )));
        }
        Ok(Self { shards })
    }

    #[must_use]
    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Index of the shard owning `worldline`.
    #[must_use]
    pub fn route(&self, worldline: &WorldlineId) -> usize {
        let hash = blake3::hash(worldline.as_str().as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(head) % self.shards as u64) as usize
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Everything needed to open a registry.
pub struct RegistryOptions {
    pub shards: usize,
    pub layout: StoreLayout,
    pub shard: ShardConfig,
    pub policies: PolicyTable,
    pub resolver: BlobResolver,
}

/// Pieces of a registry, for callers that run shards on their own threads.
pub struct RegistryParts {
    pub shards: Vec<Shard>,
    pub router: ShardRouter,
    pub ingestor: Arc<Ingestor>,
    pub query: QueryService,
}

/// Synchronous registry over all shards.
pub struct Registry {
    shards: Vec<Shard>,
    router: ShardRouter,
    ingestor: Arc<Ingestor>,
    query: QueryService,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("shards", &self.shards.len())
            .field("paused", &self.ingestor.paused_sources())
            .finish()
    }
}

impl Registry {
    /// Open every shard store and wire the shards together.
    pub fn open(options: RegistryOptions) -> Result<Self, RegistryError> {
        let router = ShardRouter::new(options.shards)?;
        options.resolver.retry_policy().validate()?;
        options.shard.store_retry.validate()?;

        let policies: Arc<dyn ClassPolicyStore> = Arc::new(options.policies);
        let resolver = Arc::new(options.resolver);

        let shards = (0..router.shards())
            .map(|index| {
                let store = options.layout.open(index)?;
                Ok(Shard::new(
                    index,
                    store,
                    Arc::clone(&policies),
                    Arc::clone(&resolver),
                    options.shard,
                ))
            })
            .collect::<Result<Vec<_>, RegistryError>>()?;

        let readers = shards.iter().map(Shard::reader).collect();
        let query = QueryService::new(readers, router, policies);

        tracing::info!(
            shards = router.shards(),
            layout = ?options.layout,
            gap_policy = ?options.shard.gap_policy,
            "registry opened"
        );

        Ok(Self {
            shards,
            router,
            ingestor: Arc::new(Ingestor::new()),
            query,
        })
    }

    /// In-memory registry with default timings. Used by tests and replay.
    pub fn in_memory(
        shards: usize,
        policies: PolicyTable,
        resolver: BlobResolver,
        shard: ShardConfig,
    ) -> Result<Self, RegistryError> {
        Self::open(RegistryOptions {
            shards,
            layout: StoreLayout::Memory,
            shard,
            policies,
            resolver,
        })
    }

    /// Ingestion entry point: validate, gate on source, route, apply.
    pub fn ingest(&mut self, event: IngestedEvent, now: u64) -> IngestOutcome {
        if let Err(e) = self.ingestor.admit(&event) {
            tracing::warn!(event_id = %event.event_id, error = %e, "event refused");
            return IngestOutcome::Rejected(e);
        }
        let index = self.router.route(&event.worldline);
        self.shards[index].ingest(event, now)
    }

    /// Ingest events one after another. A batch is not atomic: each event
    /// gets its own outcome.
    pub fn ingest_batch(
        &mut self,
        events: Vec<IngestedEvent>,
        now: u64,
    ) -> Result<Vec<IngestOutcome>, RegistryError> {
        Ingestor::validate_batch(&events)?;
        Ok(events
            .into_iter()
            .map(|event| self.ingest(event, now))
            .collect())
    }

    /// Apply an event taken from an ordered event log.
    pub fn apply_logged(&mut self, event: &IngestedEvent) -> IngestOutcome {
        let index = self.router.route(&event.worldline);
        self.shards[index].apply_logged(event)
    }

    /// Run the gap check on every shard.
    pub fn tick(&mut self, now: u64) -> TickReport {
        let mut report = TickReport::default();
        for shard in &mut self.shards {
            let shard_report = shard.tick(now);
            report.anomalies.extend(shard_report.anomalies);
            report.applied.extend(shard_report.applied);
            report.discarded = report.discarded.saturating_add(shard_report.discarded);
        }
        report
    }

    pub fn pause(&self, source: SourceId) -> bool {
        self.ingestor.pause(source)
    }

    pub fn resume(&self, source: &SourceId) -> bool {
        self.ingestor.resume(source)
    }

    #[must_use]
    pub fn query(&self) -> &QueryService {
        &self.query
    }

    #[must_use]
    pub fn router(&self) -> ShardRouter {
        self.router
    }

    /// Events currently held in reorder buffers, over all shards.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shards.iter().map(Shard::buffered).sum()
    }

    #[must_use]
    pub fn into_parts(self) -> RegistryParts {
        RegistryParts {
            shards: self.shards,
            router: self.router,
            ingestor: self.ingestor,
            query: self.query,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::policy::ClassPolicy;
    use crate::shard::GapPolicy;

    fn registry(shards: usize) -> Registry {
        let policies = PolicyTable::from_policies([ClassPolicy::new(
            "GOLD_VAULT",
            ["ORIGINATED", "ONCHAIN_ACTIVE"],
        )
        .with_transition("ORIGINATED", "ONCHAIN_ACTIVE")])
        .unwrap();
        Registry::in_memory(
            shards,
            policies,
            BlobResolver::in_memory(Arc::new(MemoryBlobStore::new())),
            ShardConfig::new(GapPolicy::Hold),
        )
        .unwrap()
    }

    #[test]
    fn router_rejects_bad_shard_counts() {
        assert!(ShardRouter::new(0).is_err());
        assert!(ShardRouter::new(MAX_SHARD_COUNT + 1).is_err());
    }

    #[test]
    fn routing_is_stable_and_in_range() {
        let router = ShardRouter::new(7).unwrap();
        let id = WorldlineId::from("wl-0123");
        let shard = router.route(&id);
        assert!(shard < 7);
        for _ in 0..10 {
            assert_eq!(router.route(&id), shard);
        }
    }

    #[test]
    fn worldlines_spread_over_shards() {
        let mut registry = registry(4);
        for i in 0..40 {
            let event = IngestedEvent::create(
                format!("c-{i}"),
                "ledger",
                1,
                "GOLD_VAULT",
                format!("SKR-{i:03}"),
                "0,0",
            );
            assert!(!registry.ingest(event, 0).reports().is_empty());
        }
        let stats = registry.query().stats().unwrap();
        assert_eq!(stats.counts.worldlines, 40);
        assert_eq!(stats.counters.applied, 40);
        assert!(stats.per_shard.iter().filter(|s| s.counts.worldlines > 0).count() > 1);
    }

    #[test]
    fn paused_source_is_refused() {
        let mut registry = registry(2);
        registry.pause(SourceId::from("ledger"));
        let event = IngestedEvent::create("c", "ledger", 1, "GOLD_VAULT", "SKR-001", "0,0");
        assert!(matches!(
            registry.ingest(event.clone(), 0),
            IngestOutcome::Rejected(RegistryError::SourcePaused(_))
        ));
        registry.resume(&SourceId::from("ledger"));
        assert!(matches!(
            registry.ingest(event, 0),
            IngestOutcome::Accepted(_)
        ));
    }
}
