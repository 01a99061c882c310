//! # Shard
//!
//! The single writer for a slice of worldlines.
//!
//! Every event for a worldline reaches the same shard, and a shard handles
//! one event at a time, so a worldline is never mutated concurrently and no
//! per-worldline locking is needed. Readers share the shard's store through
//! a [`ShardReader`]; the write lock is held only for the atomic commit,
//! never while a blob is being resolved.
//!
//! Per event the order of checks is fixed:
//! 1. duplicate event id -> `Deduplicated`
//! 2. sequence at or below the last processed one -> stale, dropped
//! 3. sequence past the next expected one -> held in the reorder buffer
//! 4. otherwise project, commit, then release whatever the buffer now allows

use crate::blob::{BlobResolver, RetryPolicy, Sleeper, ThreadSleeper};
use crate::policy::ClassPolicyStore;
use crate::primitives::DEFAULT_GAP_TIMEOUT_MS;
use crate::projector::{Change, Projection, View, project};
use crate::reorder::{Buffered, ReorderBuffer};
use crate::store::{Backend, Commit, StateStore};
use crate::{
    Anomaly, EventId, EventPayload, IngestedEvent, OrderingAnomaly, Rejection, RegistryError,
    StructuralError, WorldlineId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// What to do when a gap in a worldline's sequence never fills.
///
/// There is no default: operators must choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Report the gap, keep the buffered events and keep waiting. The gap is
    /// reported again after every further timeout.
    Hold,
    /// Report the gap and drop the buffered events without marking them
    /// seen, so a redelivery from the source can fill the gap later.
    Discard,
    /// Report the gap, then continue from the lowest buffered sequence.
    /// Events that fill the skipped range afterwards are stale.
    SkipAhead,
}

/// Tunables of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    pub gap_policy: GapPolicy,
    pub gap_timeout_ms: u64,
    /// Retry budget for commits that fail with a transient store error.
    pub store_retry: RetryPolicy,
}

impl ShardConfig {
    /// Config with the given gap policy and default timings.
    #[must_use]
    pub fn new(gap_policy: GapPolicy) -> Self {
        Self {
            gap_policy,
            gap_timeout_ms: DEFAULT_GAP_TIMEOUT_MS,
            store_retry: RetryPolicy::default(),
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of an applied or structurally rejected event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyResult {
    Applied(Change),
    Rejected(StructuralError),
}

/// One event that left the ordering layer and reached the projector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub event_id: EventId,
    pub worldline: WorldlineId,
    pub sequence: u64,
    pub result: ApplyResult,
}

/// How an accepted event was admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// The event and any buffered successors it released, in apply order.
    Applied(Vec<ApplyReport>),
    /// Held until the worldline reaches `awaiting`.
    Buffered { awaiting: u64 },
}

/// Answer of the ingestion entry point.
#[derive(Debug)]
pub enum IngestOutcome {
    Accepted(Admission),
    Rejected(RegistryError),
    /// Event id already processed or already buffered. Nothing changed.
    Deduplicated,
}

impl IngestOutcome {
    #[must_use]
    pub fn is_deduplicated(&self) -> bool {
        matches!(self, Self::Deduplicated)
    }

    /// Reports of events applied by this call.
    #[must_use]
    pub fn reports(&self) -> &[ApplyReport] {
        match self {
            Self::Accepted(Admission::Applied(reports)) => reports,
            _ => &[],
        }
    }
}

/// Result of a periodic gap check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub anomalies: Vec<Anomaly>,
    /// Events applied because of `GapPolicy::SkipAhead`.
    pub applied: Vec<ApplyReport>,
    /// Events dropped because of `GapPolicy::Discard`.
    pub discarded: usize,
}

// =============================================================================
// COUNTERS
// =============================================================================

/// Live counters of a shard, shared with readers.
#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    rejected: AtomicU64,
    deduplicated: AtomicU64,
    stale: AtomicU64,
    gap_timeouts: AtomicU64,
    discarded: AtomicU64,
    buffered: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of shard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStats {
    pub applied: u64,
    pub rejected: u64,
    pub deduplicated: u64,
    pub stale: u64,
    pub gap_timeouts: u64,
    pub discarded: u64,
    /// Events currently held in the reorder buffer.
    pub buffered: u64,
}

impl ShardStats {
    /// Sum two sets of counters.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            applied: self.applied.saturating_add(other.applied),
            rejected: self.rejected.saturating_add(other.rejected),
            deduplicated: self.deduplicated.saturating_add(other.deduplicated),
            stale: self.stale.saturating_add(other.stale),
            gap_timeouts: self.gap_timeouts.saturating_add(other.gap_timeouts),
            discarded: self.discarded.saturating_add(other.discarded),
            buffered: self.buffered.saturating_add(other.buffered),
        }
    }
}

// =============================================================================
// READER
// =============================================================================

/// Shared read access to one shard's store and counters.
#[derive(Debug, Clone)]
pub struct ShardReader {
    index: usize,
    store: Arc<RwLock<Backend>>,
    counters: Arc<Counters>,
}

impl ShardReader {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Read guard on the store. Every read through one guard sees the same
    /// committed state.
    pub fn store(&self) -> RwLockReadGuard<'_, Backend> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn stats(&self) -> ShardStats {
        let c = &self.counters;
        ShardStats {
            applied: c.applied.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            gap_timeouts: c.gap_timeouts.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            buffered: c.buffered.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// SHARD
// =============================================================================

/// Single writer over one store.
pub struct Shard {
    reader: ShardReader,
    policies: Arc<dyn ClassPolicyStore>,
    resolver: Arc<BlobResolver>,
    buffer: ReorderBuffer,
    config: ShardConfig,
    sleeper: Arc<dyn Sleeper>,
    /// Open gaps already in the anomaly journal, as (worldline, awaiting).
    /// Repeats under `GapPolicy::Hold` are counted and logged, not journaled.
    journaled_gaps: BTreeSet<(WorldlineId, u64)>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("index", &self.reader.index)
            .field("buffered", &self.buffer.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Shard {
    #[must_use]
    pub fn new(
        index: usize,
        store: Backend,
        policies: Arc<dyn ClassPolicyStore>,
        resolver: Arc<BlobResolver>,
        config: ShardConfig,
    ) -> Self {
        Self {
            reader: ShardReader {
                index,
                store: Arc::new(RwLock::new(store)),
                counters: Arc::new(Counters::default()),
            },
            policies,
            resolver,
            buffer: ReorderBuffer::new(),
            config,
            sleeper: Arc::new(ThreadSleeper),
            journaled_gaps: BTreeSet::new(),
        }
    }

    /// Replace how the shard waits between commit retries.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.reader.index
    }

    #[must_use]
    pub fn reader(&self) -> ShardReader {
        self.reader.clone()
    }

    #[must_use]
    pub fn config(&self) -> ShardConfig {
        self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, Backend> {
        self.reader.store()
    }

    fn write(&self) -> RwLockWriteGuard<'_, Backend> {
        self.reader
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_buffered(&self) {
        self.reader
            .counters
            .buffered
            .store(self.buffer.len() as u64, Ordering::Relaxed);
    }

    /// Next sequence the worldline will accept.
    ///
    /// Follows the head, not the event log: an event rejected before any
    /// Create applied leaves the worldline expecting sequence 0, so a
    /// corrected Create can still start it.
    fn expected(&self, worldline: &WorldlineId) -> Result<u64, RegistryError> {
        Ok(self
            .read()
            .get_entry(worldline)?
            .map_or(0, |entry| entry.head.last_applied.sequence.saturating_add(1)))
    }

    /// Offer one event.
    ///
    /// `now` is the caller's clock in milliseconds; it only drives gap
    /// timeouts and never reaches stored state.
    pub fn ingest(&mut self, event: IngestedEvent, now: u64) -> IngestOutcome {
        let outcome = self.admit(event, now);
        self.sync_buffered();
        outcome
    }

    fn admit(&mut self, event: IngestedEvent, now: u64) -> IngestOutcome {
        let seen = match self.read().has_seen(&event.event_id) {
            Ok(seen) => seen,
            Err(e) => return IngestOutcome::Rejected(e),
        };
        if seen {
            Counters::bump(&self.reader.counters.deduplicated);
            tracing::debug!(shard = self.index(), event_id = %event.event_id, "duplicate event");
            return IngestOutcome::Deduplicated;
        }

        let expected = match self.expected(&event.worldline) {
            Ok(expected) => expected,
            Err(e) => return IngestOutcome::Rejected(e),
        };

        if event.sequence() < expected {
            Counters::bump(&self.reader.counters.stale);
            let anomaly = OrderingAnomaly::StaleEvent {
                worldline: event.worldline.clone(),
                sequence: event.sequence(),
                last_applied: expected.saturating_sub(1),
            };
            tracing::warn!(
                shard = self.index(),
                event_id = %event.event_id,
                error = %anomaly,
                "dropping stale event"
            );
            return IngestOutcome::Rejected(anomaly.into());
        }

        if event.sequence() > expected {
            let (worldline, sequence) = (event.worldline.clone(), event.sequence());
            return match self.buffer.hold(event, now) {
                Ok(Buffered::Held) => {
                    tracing::debug!(
                        shard = self.index(),
                        worldline = %worldline,
                        sequence,
                        awaiting = expected,
                        "buffered out-of-order event"
                    );
                    IngestOutcome::Accepted(Admission::Buffered { awaiting: expected })
                }
                Ok(Buffered::Duplicate) => {
                    Counters::bump(&self.reader.counters.deduplicated);
                    IngestOutcome::Deduplicated
                }
                Err(e) => IngestOutcome::Rejected(e),
            };
        }

        let worldline = event.worldline.clone();
        let sequence = event.sequence();
        match self.apply(&event) {
            Ok(report) => {
                let mut reports = vec![report];
                self.release(&worldline, sequence.saturating_add(1), now, &mut reports);
                IngestOutcome::Accepted(Admission::Applied(reports))
            }
            Err(e) => IngestOutcome::Rejected(e),
        }
    }

    /// Apply held events for as long as the next expected one is present.
    fn release(
        &mut self,
        worldline: &WorldlineId,
        mut next: u64,
        now: u64,
        reports: &mut Vec<ApplyReport>,
    ) {
        while let Some(event) = self.buffer.pop_ready(worldline, next, now) {
            match self.apply(&event) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(
                        shard = self.index(),
                        worldline = %worldline,
                        sequence = next,
                        error = %e,
                        "failed to apply buffered event, keeping it buffered"
                    );
                    if let Err(e) = self.buffer.hold(event, now) {
                        tracing::error!(error = %e, "could not re-buffer event");
                    }
                    return;
                }
            }
            next = next.saturating_add(1);
        }
    }

    /// Apply an event from an already ordered log, bypassing the reorder
    /// buffer. Duplicates and stale events are still refused.
    pub fn apply_logged(&mut self, event: &IngestedEvent) -> IngestOutcome {
        match self.read().has_seen(&event.event_id) {
            Ok(true) => return IngestOutcome::Deduplicated,
            Ok(false) => {}
            Err(e) => return IngestOutcome::Rejected(e),
        }
        match self.expected(&event.worldline) {
            Ok(expected) if event.sequence() < expected => {
                return IngestOutcome::Rejected(
                    OrderingAnomaly::StaleEvent {
                        worldline: event.worldline.clone(),
                        sequence: event.sequence(),
                        last_applied: expected.saturating_sub(1),
                    }
                    .into(),
                );
            }
            Ok(_) => {}
            Err(e) => return IngestOutcome::Rejected(e),
        }
        match self.apply(event) {
            Ok(report) => IngestOutcome::Accepted(Admission::Applied(vec![report])),
            Err(e) => IngestOutcome::Rejected(e),
        }
    }

    /// Project one in-order event and commit its effect or its rejection.
    fn apply(&mut self, event: &IngestedEvent) -> Result<ApplyReport, RegistryError> {
        let view = self.view(event)?;
        let projection = project(&view, event, self.policies.as_ref(), |blob| {
            self.resolver.resolve(blob)
        });

        let (commit, result) = match projection {
            Projection::Applied(effect) => (
                Commit {
                    event: Some(event.clone()),
                    entry: Some(effect.entry),
                    version: effect.version,
                    edge: effect.edge,
                    ..Commit::default()
                },
                ApplyResult::Applied(effect.change),
            ),
            Projection::Rejected(error) => {
                // The head still moves past a rejected event so it is never
                // mistaken for a pending one.
                let entry = view.entry.map(|mut entry| {
                    entry.head.last_applied = event.ordering.clone();
                    entry
                });
                let rejection = Rejection {
                    event_id: event.event_id.clone(),
                    worldline: event.worldline.clone(),
                    ordering: event.ordering.clone(),
                    kind: event.payload.kind().to_string(),
                    error: error.clone(),
                    timestamp: event.timestamp,
                };
                (
                    Commit {
                        event: Some(event.clone()),
                        entry,
                        rejection: Some(rejection),
                        ..Commit::default()
                    },
                    ApplyResult::Rejected(error),
                )
            }
        };

        self.commit_with_retry(commit)?;
        if !self.journaled_gaps.is_empty() {
            self.journaled_gaps
                .remove(&(event.worldline.clone(), event.sequence()));
        }

        match &result {
            ApplyResult::Applied(change) => {
                Counters::bump(&self.reader.counters.applied);
                tracing::debug!(
                    shard = self.index(),
                    worldline = %event.worldline,
                    event_id = %event.event_id,
                    sequence = event.sequence(),
                    kind = event.payload.kind(),
                    change = ?change,
                    "applied event"
                );
            }
            ApplyResult::Rejected(error) => {
                Counters::bump(&self.reader.counters.rejected);
                tracing::warn!(
                    shard = self.index(),
                    worldline = %event.worldline,
                    event_id = %event.event_id,
                    sequence = event.sequence(),
                    error = %error,
                    "rejected event"
                );
            }
        }

        Ok(ApplyReport {
            event_id: event.event_id.clone(),
            worldline: event.worldline.clone(),
            sequence: event.sequence(),
            result,
        })
    }

    /// Read everything the projector needs under one read guard.
    fn view(&self, event: &IngestedEvent) -> Result<View, RegistryError> {
        let store = self.read();
        let entry = store.get_entry(&event.worldline)?;
        let base = match &entry {
            Some(e) => store.get_version(&event.worldline, e.head.current_version)?,
            None => None,
        };
        let edge = match &event.payload {
            EventPayload::Entangle { rel_type, target } | EventPayload::Revoke { rel_type, target } => {
                store.get_edge(&event.worldline, rel_type, target)?
            }
            _ => None,
        };
        Ok(View { entry, base, edge })
    }

    fn commit_with_retry(&self, commit: Commit) -> Result<(), RegistryError> {
        let attempts = self.config.store_retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let result = self.write().commit(commit.clone());
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt.saturating_add(1) < attempts => {
                    let delay = self.config.store_retry.delay_ms(attempt);
                    tracing::info!(
                        shard = self.index(),
                        attempt = attempt.saturating_add(1),
                        delay_ms = delay,
                        error = %e,
                        "commit failed, retrying"
                    );
                    self.sleeper.sleep_ms(delay);
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Check for gaps that have outlived the timeout and handle them per
    /// the configured [`GapPolicy`].
    pub fn tick(&mut self, now: u64) -> TickReport {
        let mut report = TickReport::default();

        for gap in self.buffer.stalled(now, self.config.gap_timeout_ms) {
            let awaiting = match self.expected(&gap.worldline) {
                Ok(expected) => expected,
                Err(e) => {
                    tracing::error!(shard = self.index(), error = %e, "gap check failed");
                    continue;
                }
            };
            let anomaly = Anomaly {
                anomaly: OrderingAnomaly::GapTimeout {
                    worldline: gap.worldline.clone(),
                    awaiting,
                    buffered: gap.buffered,
                },
                observed_at: now,
            };
            Counters::bump(&self.reader.counters.gap_timeouts);
            tracing::warn!(
                shard = self.index(),
                worldline = %gap.worldline,
                awaiting,
                buffered = gap.buffered,
                policy = ?self.config.gap_policy,
                "gap timeout"
            );
            let gap_key = (gap.worldline.clone(), awaiting);
            if !self.journaled_gaps.contains(&gap_key) {
                match self.commit_with_retry(Commit::anomaly(anomaly.clone())) {
                    Ok(()) => {
                        self.journaled_gaps.insert(gap_key.clone());
                    }
                    Err(e) => {
                        tracing::error!(shard = self.index(), error = %e, "failed to journal anomaly");
                    }
                }
            }
            report.anomalies.push(anomaly);

            match self.config.gap_policy {
                GapPolicy::Hold => self.buffer.restart_clock(&gap.worldline, now),
                GapPolicy::Discard => {
                    self.journaled_gaps.remove(&gap_key);
                    let dropped = self.buffer.drain(&gap.worldline).len();
                    self.reader
                        .counters
                        .discarded
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    report.discarded = report.discarded.saturating_add(dropped);
                }
                GapPolicy::SkipAhead => {
                    self.journaled_gaps.remove(&gap_key);
                    let first = gap.lowest_buffered;
                    if let Some(event) = self.buffer.pop_ready(&gap.worldline, first, now) {
                        match self.apply(&event) {
                            Ok(applied) => {
                                report.applied.push(applied);
                                self.release(
                                    &gap.worldline,
                                    first.saturating_add(1),
                                    now,
                                    &mut report.applied,
                                );
                            }
                            Err(e) => {
                                tracing::error!(shard = self.index(), error = %e, "skip-ahead failed");
                                if let Err(e) = self.buffer.hold(event, now) {
                                    tracing::error!(error = %e, "could not re-buffer event");
                                }
                            }
                        }
                    }
                }
            }
        }

        self.sync_buffered();
        report
    }

    /// Number of events held in the reorder buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::blob::{MemoryBlobStore, NoSleep};
    use crate::policy::{ClassPolicy, PolicyTable};
    use crate::{FieldMask, OrderingKey, Phase, VerificationStatus};

    fn shard(policy: GapPolicy) -> Shard {
        let policies = PolicyTable::from_policies([ClassPolicy::new(
            "GOLD_VAULT",
            ["ORIGINATED", "ONCHAIN_ACTIVE", "REDEEMED"],
        )
        .with_transition("ORIGINATED", "ONCHAIN_ACTIVE")
        .with_transition("ONCHAIN_ACTIVE", "REDEEMED")
        .with_transition("ONCHAIN_ACTIVE", "ONCHAIN_ACTIVE")
        .with_rel_type("COLLATERAL_FOR")])
        .unwrap();
        let resolver = BlobResolver::in_memory(Arc::new(MemoryBlobStore::new()));
        let mut config = ShardConfig::new(policy);
        config.gap_timeout_ms = 100;
        Shard::new(
            0,
            Backend::default(),
            Arc::new(policies),
            Arc::new(resolver),
            config,
        )
        .with_sleeper(Arc::new(NoSleep))
    }

    fn create() -> IngestedEvent {
        IngestedEvent::create("c", "src", 1, "GOLD_VAULT", "SKR-001", "vault")
    }

    fn phase(wl: &WorldlineId, seq: u64, phase: &str) -> IngestedEvent {
        IngestedEvent {
            event_id: format!("u{seq}").into(),
            worldline: wl.clone(),
            ordering: OrderingKey::new("src", seq),
            timestamp: seq.saturating_mul(10),
            payload: EventPayload::UpdateState {
                mask: FieldMask::phase_only(),
                blob: None,
                phase: Some(phase.into()),
            },
        }
    }

    fn history(shard: &Shard, wl: &WorldlineId) -> Vec<u64> {
        shard
            .reader()
            .store()
            .versions(wl)
            .unwrap()
            .iter()
            .map(|v| v.sequence)
            .collect()
    }

    #[test]
    fn out_of_order_events_apply_in_sequence() {
        let mut shard = shard(GapPolicy::Hold);
        let c = create();
        let wl = c.worldline.clone();
        shard.ingest(c, 0);
        shard.ingest(phase(&wl, 1, "ONCHAIN_ACTIVE"), 0);

        let out = shard.ingest(phase(&wl, 3, "REDEEMED"), 0);
        assert!(matches!(
            out,
            IngestOutcome::Accepted(Admission::Buffered { awaiting: 2 })
        ));
        // Nothing past 1 is visible while 2 is missing.
        assert_eq!(history(&shard, &wl), vec![0, 1]);

        let out = shard.ingest(phase(&wl, 2, "ONCHAIN_ACTIVE"), 0);
        let applied: Vec<u64> = out.reports().iter().map(|r| r.sequence).collect();
        assert_eq!(applied, vec![2, 3]);
        assert_eq!(history(&shard, &wl), vec![0, 1, 2, 3]);
        assert_eq!(shard.buffered(), 0);
    }

    #[test]
    fn duplicates_and_stale_events_change_nothing() {
        let mut shard = shard(GapPolicy::Hold);
        let c = create();
        let wl = c.worldline.clone();
        shard.ingest(c.clone(), 0);
        assert!(shard.ingest(c, 0).is_deduplicated());

        shard.ingest(phase(&wl, 1, "ONCHAIN_ACTIVE"), 0);
        let mut stale = phase(&wl, 1, "REDEEMED");
        stale.event_id = "other".into();
        assert!(matches!(
            shard.ingest(stale, 0),
            IngestOutcome::Rejected(RegistryError::Ordering(OrderingAnomaly::StaleEvent { .. }))
        ));

        let stats = shard.reader().stats();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(stats.stale, 1);
        assert_eq!(history(&shard, &wl), vec![0, 1]);
    }

    #[test]
    fn rejection_is_journaled_and_marks_event_seen() {
        let mut shard = shard(GapPolicy::Hold);
        let c = create();
        let wl = c.worldline.clone();
        shard.ingest(c, 0);

        let out = shard.ingest(phase(&wl, 1, "REDEEMED"), 0);
        assert!(matches!(
            out.reports()[0].result,
            ApplyResult::Rejected(StructuralError::InvalidTransition { .. })
        ));
        let reader = shard.reader();
        assert_eq!(reader.store().rejections().unwrap().len(), 1);
        assert!(shard.ingest(phase(&wl, 1, "REDEEMED"), 0).is_deduplicated());

        // The rejected sequence is consumed; the next one applies.
        let out = shard.ingest(phase(&wl, 2, "ONCHAIN_ACTIVE"), 0);
        assert!(matches!(out.reports()[0].result, ApplyResult::Applied(_)));
        let entry = reader.store().get_entry(&wl).unwrap().unwrap();
        assert_eq!(entry.head.current_phase, Phase::from("ONCHAIN_ACTIVE"));
        assert_eq!(entry.head.current_version, 1);
    }

    #[test]
    fn hold_policy_reports_and_keeps_waiting() {
        let mut shard = shard(GapPolicy::Hold);
        let c = create();
        let wl = c.worldline.clone();
        shard.ingest(c, 0);
        shard.ingest(phase(&wl, 2, "ONCHAIN_ACTIVE"), 10);

        assert!(shard.tick(50).anomalies.is_empty());
        let report = shard.tick(110);
        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(shard.buffered(), 1);
        assert_eq!(shard.reader().store().anomalies().unwrap().len(), 1);

        // Reported again only after another full timeout.
        assert!(shard.tick(150).anomalies.is_empty());
        assert_eq!(shard.tick(210).anomalies.len(), 1);
    }

    #[test]
    fn open_gap_is_journaled_once() {
        let mut shard = shard(GapPolicy::Hold);
        let c = create();
        let wl = c.worldline.clone();
        shard.ingest(c, 0);
        shard.ingest(phase(&wl, 2, "ONCHAIN_ACTIVE"), 0);

        for now in [100, 200, 300, 400] {
            assert_eq!(shard.tick(now).anomalies.len(), 1);
        }
        let reader = shard.reader();
        assert_eq!(reader.store().anomalies().unwrap().len(), 1);
        assert_eq!(reader.stats().gap_timeouts, 4);

        // Filling the gap closes it; a later gap is journaled on its own.
        shard.ingest(phase(&wl, 1, "ONCHAIN_ACTIVE"), 400);
        shard.ingest(phase(&wl, 4, "REDEEMED"), 400);
        assert_eq!(shard.tick(500).anomalies.len(), 1);
        assert_eq!(reader.store().anomalies().unwrap().len(), 2);
    }

    #[test]
    fn discard_policy_drops_without_marking_seen() {
        let mut shard = shard(GapPolicy::Discard);
        let c = create();
        let wl = c.worldline.clone();
        shard.ingest(c, 0);
        shard.ingest(phase(&wl, 2, "ONCHAIN_ACTIVE"), 0);

        let report = shard.tick(100);
        assert_eq!(report.discarded, 1);
        assert_eq!(shard.buffered(), 0);

        // Redelivery fills the gap.
        shard.ingest(phase(&wl, 1, "ONCHAIN_ACTIVE"), 200);
        let out = shard.ingest(phase(&wl, 2, "ONCHAIN_ACTIVE"), 200);
        assert_eq!(out.reports().len(), 1);
        assert_eq!(history(&shard, &wl), vec![0, 1, 2]);
    }

    #[test]
    fn skip_ahead_policy_applies_from_lowest_buffered() {
        let mut shard = shard(GapPolicy::SkipAhead);
        let c = create();
        let wl = c.worldline.clone();
        shard.ingest(c, 0);
        shard.ingest(phase(&wl, 3, "REDEEMED"), 0);
        shard.ingest(phase(&wl, 2, "ONCHAIN_ACTIVE"), 0);

        let report = shard.tick(100);
        assert_eq!(report.anomalies.len(), 1);
        let applied: Vec<u64> = report.applied.iter().map(|r| r.sequence).collect();
        assert_eq!(applied, vec![2, 3]);

        // The skipped sequence is stale now.
        assert!(matches!(
            shard.ingest(phase(&wl, 1, "ONCHAIN_ACTIVE"), 200),
            IngestOutcome::Rejected(RegistryError::Ordering(_))
        ));
    }

    #[test]
    fn entangle_then_revoke_then_reentangle() {
        let mut shard = shard(GapPolicy::Hold);
        let c = create();
        let wl = c.worldline.clone();
        shard.ingest(c, 0);

        let edge = |seq: u64, payload: EventPayload| IngestedEvent {
            event_id: format!("g{seq}").into(),
            worldline: wl.clone(),
            ordering: OrderingKey::new("src", seq),
            timestamp: seq,
            payload,
        };
        let entangle = EventPayload::Entangle {
            rel_type: "COLLATERAL_FOR".into(),
            target: "wl-other".into(),
        };
        let revoke = EventPayload::Revoke {
            rel_type: "COLLATERAL_FOR".into(),
            target: "wl-other".into(),
        };
        shard.ingest(edge(1, entangle.clone()), 0);
        shard.ingest(edge(2, revoke.clone()), 0);
        let reader = shard.reader();
        assert!(!reader.store().edges_from(&wl).unwrap()[0].is_active());

        shard.ingest(edge(3, revoke), 0);
        shard.ingest(edge(4, entangle), 0);
        let edges = reader.store().edges_from(&wl).unwrap();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].is_active());
        assert_eq!(edges[0].created_at, 4);
    }

    #[test]
    fn integrity_mismatch_never_becomes_current() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.put("B", br#"{"frequency":{"grams":1}}"#.to_vec());
        let mut shard = shard(GapPolicy::Hold);
        shard.resolver = Arc::new(BlobResolver::in_memory(blobs));

        let c = create();
        let wl = c.worldline.clone();
        shard.ingest(c, 0);
        let update = IngestedEvent {
            event_id: "b1".into(),
            worldline: wl.clone(),
            ordering: OrderingKey::new("src", 1),
            timestamp: 5,
            payload: EventPayload::UpdateState {
                mask: FieldMask::payload(),
                blob: Some(crate::BlobRef::new("B", crate::Digest::of(b"declared"))),
                phase: None,
            },
        };
        shard.ingest(update, 0);

        let reader = shard.reader();
        let store = reader.store();
        let versions = store.versions(&wl).unwrap();
        assert_eq!(versions[1].status, VerificationStatus::IntegrityMismatch);
        let entry = store.get_entry(&wl).unwrap().unwrap();
        assert_eq!(entry.head.current_version, 0);
        assert!(entry.head.is_degraded());
    }
}
