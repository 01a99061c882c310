//! # Blob Resolver
//!
//! Fetches content-addressed state payloads, checks them against the digest
//! the event declared, and decodes them into structured attributes.
//!
//! The declared digest travels with the event, so the resolver never has to
//! be trusted: whatever bytes the store returns are hashed here and compared.
//! Successful fetches are cached by reference forever (references are
//! immutable); failures are never cached so a later attempt can succeed.

use crate::primitives::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_RESOLVE_ATTEMPTS, MAX_BLOB_SIZE,
};
use crate::{BlobRef, Digest, Frequency, Polarization, RegistryError, TransientError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// BLOB STORE INTERFACE
// =============================================================================

/// Why a fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The store has no content for this reference. Not retried.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The content exceeds the accepted size. Not retried.
    #[error("blob {reference} is {size} bytes, limit is {limit}")]
    TooLarge {
        reference: String,
        size: usize,
        limit: usize,
    },

    /// The store could not answer right now. Retried with backoff.
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A content-addressed blob store.
///
/// The same reference must always yield the same bytes or an error.
pub trait BlobStore: Send + Sync {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError>;
}

/// Blob store held in memory. References are arbitrary strings.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes under an explicit reference.
    pub fn put(&self, reference: impl Into<String>, bytes: Vec<u8>) {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        blobs.insert(reference.into(), bytes);
    }

    /// Store bytes under their own digest and return a ready-made reference.
    pub fn put_content(&self, bytes: Vec<u8>) -> BlobRef {
        let digest = Digest::of(&bytes);
        let reference = digest.to_hex();
        self.put(reference.clone(), bytes);
        BlobRef::new(reference, digest)
    }
}

impl BlobStore for MemoryBlobStore {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        blobs
            .get(reference)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(reference.to_string()))
    }
}

/// Blob store backed by a directory: one file per reference.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a reference to a file under the root, refusing anything that
    /// could escape it.
    fn path_for(&self, reference: &str) -> Result<PathBuf, FetchError> {
        let clean = !reference.is_empty()
            && reference
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !reference.starts_with('.');
        if clean {
            Ok(self.root.join(reference))
        } else {
            Err(FetchError::NotFound(reference.to_string()))
        }
    }
}

impl BlobStore for FsBlobStore {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.path_for(reference)?;
        let size = match std::fs::metadata(&path) {
            Ok(meta) => usize::try_from(meta.len()).unwrap_or(usize::MAX),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(reference.to_string()));
            }
            Err(e) => return Err(FetchError::Unavailable(e.to_string())),
        };
        if size > MAX_BLOB_SIZE {
            return Err(FetchError::TooLarge {
                reference: reference.to_string(),
                size,
                limit: MAX_BLOB_SIZE,
            });
        }
        std::fs::read(&path).map_err(|e| FetchError::Unavailable(e.to_string()))
    }
}

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Bounded exponential backoff, in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, first try included. At least 1.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RESOLVE_ATTEMPTS,
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
            max_delay_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `retry` (0 = the wait after the first failure).
    #[must_use]
    pub fn delay_ms(&self, retry: u32) -> u64 {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.max_attempts == 0 {
            return Err(RegistryError::Config(
                "resolver max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(RegistryError::Config(
                "resolver base_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the resolver waits between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep_ms(&self, ms: u64);
}

/// Blocks the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Does not wait. Used for replay and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep_ms(&self, _ms: u64) {}
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Structured content of a state blob.
///
/// Encoded as JSON: `{"frequency": {"grams": 1000}, "polarization": ["LBMA"]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSnapshot {
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub polarization: Polarization,
}

/// Result of resolving a blob against its declared digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Bytes fetched, digest matched, content decoded.
    Verified { snapshot: BlobSnapshot, digest: Digest },
    /// Bytes fetched but hashed to something other than declared.
    Mismatch { observed: Digest },
    /// Bytes could not be fetched or decoded.
    Unresolved { reason: String },
}

/// What the cache keeps per reference: the bytes' digest and, if they
/// decoded, their content.
#[derive(Debug, Clone)]
struct Fetched {
    digest: Digest,
    snapshot: Option<BlobSnapshot>,
}

/// Fetch, verify and decode blobs with retry and a success cache.
pub struct BlobResolver {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    cache: RwLock<BTreeMap<String, Fetched>>,
}

impl std::fmt::Debug for BlobResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobResolver")
            .field("retry", &self.retry)
            .field("cached", &self.cached_len())
            .finish_non_exhaustive()
    }
}

impl BlobResolver {
    /// Resolver that blocks the thread between retries.
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>, retry: RetryPolicy) -> Self {
        Self::with_sleeper(store, retry, Arc::new(ThreadSleeper))
    }

    #[must_use]
    pub fn with_sleeper(
        store: Arc<dyn BlobStore>,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            store,
            retry,
            sleeper,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Resolver over an in-memory store that never waits.
    #[must_use]
    pub fn in_memory(store: Arc<MemoryBlobStore>) -> Self {
        Self::with_sleeper(store, RetryPolicy::default(), Arc::new(NoSleep))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Number of references held in the cache.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Resolve a blob and compare it with the declared digest.
    pub fn resolve(&self, blob: &BlobRef) -> Resolution {
        let fetched = match self.cached(&blob.reference) {
            Some(hit) => hit,
            None => match self.fetch_with_retry(&blob.reference) {
                Ok(fetched) => fetched,
                Err(reason) => return Resolution::Unresolved { reason },
            },
        };

        if fetched.digest != blob.expected_digest {
            tracing::warn!(
                reference = %blob.reference,
                expected = %blob.expected_digest,
                observed = %fetched.digest,
                "blob digest mismatch"
            );
            return Resolution::Mismatch {
                observed: fetched.digest,
            };
        }

        match fetched.snapshot {
            Some(snapshot) => Resolution::Verified {
                snapshot,
                digest: fetched.digest,
            },
            None => Resolution::Unresolved {
                reason: format!("blob {} is not a valid state document", blob.reference),
            },
        }
    }

    fn cached(&self, reference: &str) -> Option<Fetched> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
    }

    fn fetch_with_retry(&self, reference: &str) -> Result<Fetched, String> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 0..attempts {
            match self.store.fetch(reference) {
                Ok(bytes) => {
                    let fetched = Fetched {
                        digest: Digest::of(&bytes),
                        snapshot: serde_json::from_slice(&bytes).ok(),
                    };
                    // Undecodable bytes are a failure: leave them uncached.
                    if fetched.snapshot.is_some() {
                        self.cache
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(reference.to_string(), fetched.clone());
                    }
                    return Ok(fetched);
                }
                Err(e) if e.is_retryable() && attempt.saturating_add(1) < attempts => {
                    let delay = self.retry.delay_ms(attempt);
                    tracing::info!(
                        reference,
                        attempt = attempt.saturating_add(1),
                        delay_ms = delay,
                        error = %e,
                        "blob fetch failed, retrying"
                    );
                    self.sleeper.sleep_ms(delay);
                    last = e.to_string();
                }
                Err(e) => {
                    last = e.to_string();
                    if !e.is_retryable() {
                        return Err(last);
                    }
                }
            }
        }

        let timeout = TransientError::ResolutionTimeout {
            reference: reference.to_string(),
            attempts,
            reason: last,
        };
        tracing::warn!(error = %timeout, "blob resolution exhausted");
        Err(timeout.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
