//! # worldline-core
//!
//! The deterministic state projection for Worldline - THE REGISTRY.
//!
//! This crate turns an ordered, deduplicated stream of identity-scoped
//! events into versioned worldlines, class-governed lifecycle phases and a
//! typed entanglement graph, and answers queries over the result.
//!
//! ## Write Path
//!
//! ```text
//! event -> Ingestor -> ShardRouter -> Shard (dedup, reorder) -> project() -> StateStore
//!                                         |                       |
//!                                         |                       +-- ClassPolicyStore
//!                                         +-- Commit (atomic)     +-- BlobResolver
//! ```
//!
//! ## Architectural Constraints
//!
//! - Single writer per shard: a worldline is only ever mutated by its shard
//! - Deterministic: `BTreeMap` only, no floats, timestamps come from events
//! - Closed: class behavior is policy data, never injected code
//! - Has NO async, NO network dependencies (pure Rust)

// =============================================================================
// MODULES
// =============================================================================

pub mod blob;
pub mod ingestor;
pub mod policy;
pub mod primitives;
pub mod projector;
pub mod query;
pub mod registry;
pub mod reorder;
pub mod shard;
pub mod snapshot;
pub mod store;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    AnchorRef, Anomaly, BlobRef, ClassId, CurrentState, Digest, Entanglement, EventId,
    EventPayload, FieldMask, Frequency, IngestedEvent, OrderingAnomaly, OrderingKey, Phase,
    Polarization, RegistryError, Rejection, RelType, SourceId, StateVersion, StructuralError,
    TransientError, VerificationStatus, Worldline, WorldlineEntry, WorldlineHead, WorldlineId,
};

// =============================================================================
// RE-EXPORTS: Registry
// =============================================================================

pub use blob::{
    BlobResolver, BlobSnapshot, BlobStore, FetchError, FsBlobStore, MemoryBlobStore, Resolution,
    RetryPolicy,
};
pub use ingestor::Ingestor;
pub use policy::{ClassPolicy, ClassPolicyStore, PolicyTable};
pub use projector::{Change, Projection, View, project};
pub use query::{AttributeMatch, Page, PhaseScan, QueryService, RegistryStats, ShardSummary};
pub use registry::{Registry, RegistryOptions, RegistryParts, ShardRouter};
pub use reorder::ReorderBuffer;
pub use shard::{
    Admission, ApplyReport, ApplyResult, GapPolicy, IngestOutcome, Shard, ShardConfig,
    ShardReader, ShardStats, TickReport,
};
pub use snapshot::{
    CanonicalSnapshot, EventLog, ReplayReport, SnapshotHeader, canonical_checksum, replay,
    verify_export,
};
pub use store::{Backend, Commit, MemoryStore, RedbStore, StateStore, StoreCounts, StoreLayout};
