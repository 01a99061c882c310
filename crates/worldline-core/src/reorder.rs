//! # Reorder Buffer
//!
//! Holds events that arrived ahead of their worldline's next expected
//! sequence until the gap fills.
//!
//! Time is passed in explicitly (`now`, in milliseconds) so the buffer is
//! deterministic under test and never reads a clock itself.

use crate::primitives::MAX_BUFFERED_PER_WORLDLINE;
use crate::{IngestedEvent, RegistryError, WorldlineId};
use std::collections::BTreeMap;

/// Events waiting on one worldline.
#[derive(Debug, Clone, Default)]
struct Pending {
    events: BTreeMap<u64, IngestedEvent>,
    /// Tick at which the current wait started. Reset on progress.
    waiting_since: u64,
}

/// A worldline whose gap has been open longer than the timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledGap {
    pub worldline: WorldlineId,
    /// Lowest buffered sequence.
    pub lowest_buffered: u64,
    pub buffered: usize,
    pub waiting_since: u64,
}

/// Outcome of offering an event to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffered {
    /// Newly held.
    Held,
    /// The same event is already held.
    Duplicate,
}

/// Per-worldline out-of-order buffer.
#[derive(Debug, Clone, Default)]
pub struct ReorderBuffer {
    pending: BTreeMap<WorldlineId, Pending>,
}

impl ReorderBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold an event until its predecessors arrive.
    ///
    /// A different event claiming an already-held sequence is refused, as is
    /// anything past the per-worldline limit.
    pub fn hold(&mut self, event: IngestedEvent, now: u64) -> Result<Buffered, RegistryError> {
        let pending = self
            .pending
            .entry(event.worldline.clone())
            .or_insert_with(|| Pending {
                events: BTreeMap::new(),
                waiting_since: now,
            });

        if let Some(existing) = pending.events.get(&event.sequence()) {
            return if existing.event_id == event.event_id {
                Ok(Buffered::Duplicate)
            } else {
                Err(RegistryError::AlreadyBuffered(event.event_id))
            };
        }
        if pending.events.len() >= MAX_BUFFERED_PER_WORLDLINE {
            return Err(RegistryError::BufferFull {
                worldline: event.worldline,
                limit: MAX_BUFFERED_PER_WORLDLINE,
            });
        }

        pending.events.insert(event.sequence(), event);
        Ok(Buffered::Held)
    }

    /// Take the buffered event with exactly the `expected` sequence, if held.
    pub fn pop_ready(
        &mut self,
        worldline: &WorldlineId,
        expected: u64,
        now: u64,
    ) -> Option<IngestedEvent> {
        let pending = self.pending.get_mut(worldline)?;
        let event = pending.events.remove(&expected)?;
        if pending.events.is_empty() {
            self.pending.remove(worldline);
        } else {
            pending.waiting_since = now;
        }
        Some(event)
    }

    /// Drop buffered events at or below `sequence`, which can no longer apply.
    ///
    /// Returns the dropped events.
    pub fn discard_through(&mut self, worldline: &WorldlineId, sequence: u64) -> Vec<IngestedEvent> {
        let Some(pending) = self.pending.get_mut(worldline) else {
            return Vec::new();
        };
        let keep = pending.events.split_off(&sequence.saturating_add(1));
        let dropped = std::mem::replace(&mut pending.events, keep);
        if pending.events.is_empty() {
            self.pending.remove(worldline);
        }
        dropped.into_values().collect()
    }

    /// Remove and return everything held for a worldline.
    pub fn drain(&mut self, worldline: &WorldlineId) -> Vec<IngestedEvent> {
        self.pending
            .remove(worldline)
            .map(|p| p.events.into_values().collect())
            .unwrap_or_default()
    }

    /// Restart the wait clock of a worldline.
    pub fn restart_clock(&mut self, worldline: &WorldlineId, now: u64) {
        if let Some(pending) = self.pending.get_mut(worldline) {
            pending.waiting_since = now;
        }
    }

    /// Lowest sequence held for a worldline.
    #[must_use]
    pub fn lowest(&self, worldline: &WorldlineId) -> Option<u64> {
        self.pending
            .get(worldline)
            .and_then(|p| p.events.keys().next().copied())
    }

    /// Gaps that have been open for at least `timeout_ms` at tick `now`,
    /// in worldline order.
    #[must_use]
    pub fn stalled(&self, now: u64, timeout_ms: u64) -> Vec<StalledGap> {
        self.pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.waiting_since) >= timeout_ms)
            .filter_map(|(id, p)| {
                p.events.keys().next().map(|&lowest| StalledGap {
                    worldline: id.clone(),
                    lowest_buffered: lowest,
                    buffered: p.events.len(),
                    waiting_since: p.waiting_since,
                })
            })
            .collect()
    }

    /// Number of events held for one worldline.
    #[must_use]
    pub fn held_for(&self, worldline: &WorldlineId) -> usize {
        self.pending.get(worldline).map_or(0, |p| p.events.len())
    }

    /// Total events held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.values().map(|p| p.events.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
