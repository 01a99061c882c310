//! # Error Types
//!
//! Three families with different handling:
//! - `StructuralError`: permanent; the event is rejected and journaled,
//!   never retried.
//! - `TransientError`: retried with bounded backoff by the shard.
//! - `OrderingAnomaly`: logged and counted, never fatal.
//!
//! `RegistryError` wraps all of them plus storage and configuration failures.

use super::ids::{ClassId, EventId, Phase, RelType, SourceId, WorldlineId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Permanent rejection of an event.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StructuralError {
    #[error("unknown class: {0}")]
    UnknownClass(ClassId),

    #[error("worldline {0} already created")]
    DuplicateCreate(WorldlineId),

    #[error("illegal transition for class {class}: {from:?} -> {to}")]
    InvalidTransition {
        class: ClassId,
        from: Option<Phase>,
        to: Phase,
    },

    #[error("relationship type {rel_type} not allowed for class {class}")]
    RelTypeNotAllowed { class: ClassId, rel_type: RelType },

    #[error("malformed anchor: {0}")]
    MalformedAnchor(String),

    #[error("worldline {0} has no Create applied")]
    UnknownWorldline(WorldlineId),

    #[error("declared worldline id {declared} does not match derived id {derived}")]
    WorldlineIdMismatch {
        declared: WorldlineId,
        derived: WorldlineId,
    },

    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

/// Failure that may succeed on retry.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransientError {
    #[error("blob {reference} unresolved after {attempts} attempts: {reason}")]
    ResolutionTimeout {
        reference: String,
        attempts: u32,
        reason: String,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Event arrived out of the expected order.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OrderingAnomaly {
    #[error("stale event for {worldline}: sequence {sequence} <= last applied {last_applied}")]
    StaleEvent {
        worldline: WorldlineId,
        sequence: u64,
        last_applied: u64,
    },

    #[error("gap timeout for {worldline}: awaiting sequence {awaiting}, {buffered} buffered")]
    GapTimeout {
        worldline: WorldlineId,
        awaiting: u64,
        buffered: usize,
    },
}

/// Top-level error of the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Transient(#[from] TransientError),

    #[error(transparent)]
    Ordering(#[from] OrderingAnomaly),

    #[error("worldline not found: {0}")]
    NotFound(WorldlineId),

    #[error("source {0} is paused")]
    SourcePaused(SourceId),

    #[error("event {0} is already buffered")]
    AlreadyBuffered(EventId),

    #[error("reorder buffer for {worldline} is full ({limit} events)")]
    BufferFull { worldline: WorldlineId, limit: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RegistryError {
    /// Errors worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Io(_))
    }

    /// Storage failure shorthand used at redb call sites.
    pub(crate) fn store(e: impl std::fmt::Display) -> Self {
        Self::Transient(TransientError::StoreUnavailable(e.to_string()))
    }

    pub(crate) fn codec(e: impl std::fmt::Display) -> Self {
        Self::Serialization(e.to_string())
    }
}
