//! # Canonical Snapshot & Replay
//!
//! > Runtime stores (redb files, in-memory maps) are not guaranteed to be
//! > bit-identical across runs. The canonical snapshot is: a sorted postcard
//! > stream of every worldline, version and edge, plus its BLAKE3 checksum.
//!
//! Two registries hold the same projection exactly when their snapshot
//! checksums match. Replay rebuilds a registry from another's event log, and
//! comparing checksums afterwards proves the rebuild.

use crate::primitives::{DEFAULT_SCAN_PAGE, FORMAT_VERSION, MAGIC_BYTES};
use crate::query::QueryService;
use crate::registry::Registry;
use crate::shard::{Admission, ApplyResult, IngestOutcome};
use crate::store::StateStore;
use crate::{
    Digest, Entanglement, IngestedEvent, RegistryError, StateVersion, WorldlineEntry, WorldlineId,
};
use serde::{Deserialize, Serialize};

/// Maximum number of worldlines accepted on import.
///
/// Prevents memory exhaustion from malicious or corrupted data.
pub const MAX_IMPORT_WORLDLINES: u64 = 1_000_000;

/// Maximum number of versions or edges accepted on import.
pub const MAX_IMPORT_RECORDS: u64 = 50_000_000;

// =============================================================================
// CANONICAL FORMAT
// =============================================================================

/// Header in front of every exported snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub worldlines: u64,
    pub versions: u64,
    pub edges: u64,
    /// BLAKE3 of the postcard-encoded body.
    pub checksum: Digest,
}

impl SnapshotHeader {
    /// Validate the header.
    ///
    /// Error messages stay generic so they do not describe the format.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if &self.magic != MAGIC_BYTES {
            return Err(RegistryError::Serialization(
                "Invalid file format".to_string(),
            ));
        }
        if self.version != FORMAT_VERSION {
            return Err(RegistryError::Serialization(
                "Unsupported file version".to_string(),
            ));
        }
        if self.worldlines > MAX_IMPORT_WORLDLINES {
            return Err(RegistryError::Serialization(format!(
                "Worldline count {} exceeds maximum allowed {}",
                self.worldlines, MAX_IMPORT_WORLDLINES
            )));
        }
        if self.versions > MAX_IMPORT_RECORDS || self.edges > MAX_IMPORT_RECORDS {
            return Err(RegistryError::Serialization(
                "Record count exceeds maximum allowed".to_string(),
            ));
        }
        Ok(())
    }
}

/// Every stored record of a registry, sorted.
///
/// - entries by worldline id
/// - versions by (worldline id, sequence)
/// - edges by (source, rel type, target)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSnapshot {
    pub entries: Vec<WorldlineEntry>,
    pub versions: Vec<StateVersion>,
    pub edges: Vec<Entanglement>,
}

impl CanonicalSnapshot {
    /// Read every shard and sort the result.
    ///
    /// Each shard is read under one guard; callers that need a global
    /// point in time must stop ingestion first.
    pub fn capture(query: &QueryService) -> Result<Self, RegistryError> {
        let mut snapshot = Self::default();
        for reader in query.readers() {
            let store = reader.store();
            let mut after = None;
            loop {
                let entries = store.entries(after.as_ref(), DEFAULT_SCAN_PAGE)?;
                let Some(last) = entries.last() else { break };
                after = Some(last.worldline.id.clone());
                let full = entries.len() == DEFAULT_SCAN_PAGE;
                for entry in entries {
                    snapshot.versions.extend(store.versions(&entry.worldline.id)?);
                    snapshot.edges.extend(store.edges_from(&entry.worldline.id)?);
                    snapshot.entries.push(entry);
                }
                if !full {
                    break;
                }
            }
        }
        snapshot.sort();
        Ok(snapshot)
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.worldline.id.cmp(&b.worldline.id));
        self.versions
            .sort_by(|a, b| (&a.worldline, a.sequence).cmp(&(&b.worldline, b.sequence)));
        self.edges.sort_by(|a, b| {
            (&a.source, &a.rel_type, &a.target).cmp(&(&b.source, &b.rel_type, &b.target))
        });
    }

    fn body(&self) -> Result<Vec<u8>, RegistryError> {
        postcard::to_allocvec(self).map_err(|e| RegistryError::Serialization(format!("Data: {e}")))
    }

    /// BLAKE3 of the canonical encoding.
    pub fn checksum(&self) -> Result<Digest, RegistryError> {
        Ok(Digest::of(&self.body()?))
    }

    /// Encode as `[header_len: u32 LE] [header] [body]`.
    pub fn export(&self) -> Result<Vec<u8>, RegistryError> {
        let body = self.body()?;
        let header = SnapshotHeader {
            magic: *MAGIC_BYTES,
            version: FORMAT_VERSION,
            worldlines: self.entries.len() as u64,
            versions: self.versions.len() as u64,
            edges: self.edges.len() as u64,
            checksum: Digest::of(&body),
        };
        let header_bytes = postcard::to_allocvec(&header)
            .map_err(|e| RegistryError::Serialization(format!("Header: {e}")))?;

        let mut out = Vec::with_capacity(4 + header_bytes.len() + body.len());
        out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode and verify an exported snapshot.
    pub fn import(data: &[u8]) -> Result<Self, RegistryError> {
        let Some((len, rest)) = data.split_first_chunk::<4>() else {
            return Err(RegistryError::Serialization("Data too short".to_string()));
        };
        let header_len = u32::from_le_bytes(*len) as usize;
        if rest.len() < header_len {
            return Err(RegistryError::Serialization(
                "Data too short for header".to_string(),
            ));
        }
        let (header_bytes, body) = rest.split_at(header_len);

        let header: SnapshotHeader = postcard::from_bytes(header_bytes)
            .map_err(|e| RegistryError::Serialization(format!("Header: {e}")))?;
        header.validate()?;

        let computed = Digest::of(body);
        if computed != header.checksum {
            return Err(RegistryError::Serialization(format!(
                "Checksum mismatch: expected {}, got {}",
                header.checksum, computed
            )));
        }

        let snapshot: Self = postcard::from_bytes(body)
            .map_err(|e| RegistryError::Serialization(format!("Data: {e}")))?;
        if snapshot.entries.len() as u64 != header.worldlines
            || snapshot.versions.len() as u64 != header.versions
            || snapshot.edges.len() as u64 != header.edges
        {
            return Err(RegistryError::Serialization(
                "Record count mismatch".to_string(),
            ));
        }
        Ok(snapshot)
    }
}

/// Checksum of a registry's current projection.
pub fn canonical_checksum(query: &QueryService) -> Result<Digest, RegistryError> {
    CanonicalSnapshot::capture(query)?.checksum()
}

/// True if `data` is a valid export of exactly what `query` holds.
pub fn verify_export(query: &QueryService, data: &[u8]) -> Result<bool, RegistryError> {
    let imported = CanonicalSnapshot::import(data)?;
    Ok(imported == CanonicalSnapshot::capture(query)?)
}

// =============================================================================
// REPLAY
// =============================================================================

/// Summary of a replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub events: u64,
    pub batches: u64,
    pub applied: u64,
    pub rejected: u64,
    /// Events the target had already processed.
    pub skipped: u64,
}

/// Read logged events from a source registry in batches of `batch_size`.
///
/// Within a shard the log is ordered by (worldline, sequence), which is the
/// only order replay needs.
pub struct EventLog<'a> {
    query: &'a QueryService,
    batch_size: usize,
    shard: usize,
    after: Option<(WorldlineId, u64)>,
}

impl<'a> EventLog<'a> {
    #[must_use]
    pub fn new(query: &'a QueryService, batch_size: usize) -> Self {
        Self {
            query,
            batch_size: batch_size.max(1),
            shard: 0,
            after: None,
        }
    }
}

impl Iterator for EventLog<'_> {
    type Item = Result<Vec<IngestedEvent>, RegistryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = self.query.readers().get(self.shard)?;
            let after = self.after.as_ref().map(|(id, seq)| (id, *seq));
            let batch = match reader.store().logged_events(after, self.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    self.shard = usize::MAX;
                    return Some(Err(e));
                }
            };
            match batch.last() {
                Some(last) => {
                    self.after = Some((last.worldline.clone(), last.sequence()));
                    return Some(Ok(batch));
                }
                None => {
                    self.shard = self.shard.saturating_add(1);
                    self.after = None;
                }
            }
        }
    }
}

/// Rebuild `target` from `source`'s event log, `batch_size` events at a time.
///
/// Blobs are resolved again through the target's resolver.
pub fn replay(
    source: &QueryService,
    target: &mut Registry,
    batch_size: usize,
) -> Result<ReplayReport, RegistryError> {
    let mut report = ReplayReport::default();
    for batch in EventLog::new(source, batch_size) {
        let batch = batch?;
        report.batches = report.batches.saturating_add(1);
        for event in &batch {
            report.events = report.events.saturating_add(1);
            match target.apply_logged(event) {
                IngestOutcome::Accepted(Admission::Applied(reports)) => {
                    for applied in &reports {
                        match applied.result {
                            ApplyResult::Applied(_) => {
                                report.applied = report.applied.saturating_add(1);
                            }
                            ApplyResult::Rejected(_) => {
                                report.rejected = report.rejected.saturating_add(1);
                            }
                        }
                    }
                }
                IngestOutcome::Accepted(Admission::Buffered { .. }) => {}
                IngestOutcome::Deduplicated => report.skipped = report.skipped.saturating_add(1),
                IngestOutcome::Rejected(RegistryError::Ordering(_)) => {
                    report.skipped = report.skipped.saturating_add(1);
                }
                IngestOutcome::Rejected(e) => return Err(e),
            }
        }
    }
    tracing::info!(
        events = report.events,
        batches = report.batches,
        applied = report.applied,
        rejected = report.rejected,
        "replay finished"
    );
    Ok(report)
}

// =============================================================================
// TESTS
// =============================================================================
