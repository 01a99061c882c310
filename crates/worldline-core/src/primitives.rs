//! # Primitives
//!
//! Hardcoded runtime constants for the Worldline CORE.
//!
//! These are compiled into the binary and are immutable at runtime.
//! Tunables that operators may change (timeouts, retry budgets, shard
//! count) live in configuration; the values here are limits and defaults.

/// Magic bytes for the canonical snapshot header.
pub const MAGIC_BYTES: &[u8; 4] = b"WLSN";

/// Current snapshot format version.
///
/// Increment this when making breaking changes to the snapshot format.
pub const FORMAT_VERSION: u8 = 1;

/// Default number of shards when none is configured.
pub const DEFAULT_SHARD_COUNT: usize = 8;

/// Upper bound on shards, to keep routing tables and worker threads bounded.
pub const MAX_SHARD_COUNT: usize = 256;

/// Maximum number of events buffered per worldline while waiting for a gap.
///
/// Events beyond this are refused so a broken source cannot exhaust memory.
pub const MAX_BUFFERED_PER_WORLDLINE: usize = 1024;

/// Default resolver attempt budget (first try included).
pub const DEFAULT_RESOLVE_ATTEMPTS: u32 = 4;

/// Default first backoff delay in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 50;

/// Default ceiling on a single backoff delay in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 2_000;

/// Default gap timeout in milliseconds.
pub const DEFAULT_GAP_TIMEOUT_MS: u64 = 30_000;

/// Default page size for class/phase scans.
pub const DEFAULT_SCAN_PAGE: usize = 256;

/// Maximum page size for class/phase scans.
pub const MAX_SCAN_PAGE: usize = 10_000;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for identifier strings (class, phase, rel type, ids).
pub const MAX_IDENTIFIER_LENGTH: usize = 256;

/// Maximum length for anchor references.
pub const MAX_ANCHOR_LENGTH: usize = 1024;

/// Maximum length for origin coordinates.
pub const MAX_ORIGIN_LENGTH: usize = 1024;

/// Maximum size of a resolved blob (4 MB).
pub const MAX_BLOB_SIZE: usize = 4 * 1024 * 1024;

/// Maximum number of events in a single batch.
pub const MAX_BATCH_LENGTH: usize = 10_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_correct() {
        assert_eq!(MAGIC_BYTES, b"WLSN");
    }

    #[test]
    fn default_shards_within_bounds() {
        assert!(DEFAULT_SHARD_COUNT > 0);
        assert!(DEFAULT_SHARD_COUNT <= MAX_SHARD_COUNT);
        assert!(DEFAULT_BACKOFF_BASE_MS <= DEFAULT_BACKOFF_MAX_MS);
    }
}
