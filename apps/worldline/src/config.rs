//! # Configuration
//!
//! TOML configuration of a registry deployment.
//!
//! ```toml
//! [storage]
//! backend = "redb"
//! path = "./worldline-data"
//!
//! [ingest]
//! shards = 8
//! gap_timeout_ms = 30000
//! gap_policy = "hold"      # required: hold | discard | skip_ahead
//! tick_interval_ms = 1000
//!
//! [resolver]
//! max_attempts = 4
//! base_delay_ms = 50
//! max_delay_ms = 2000
//! blob_dir = "./blobs"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [[classes]]
//! id = "GOLD_VAULT"
//! phases = ["ORIGINATED", "ONCHAIN_ACTIVE", "REDEEMED"]
//! transitions = [["ORIGINATED", "ONCHAIN_ACTIVE"], ["ONCHAIN_ACTIVE", "REDEEMED"]]
//! rel_types = ["COLLATERAL_FOR"]
//! ```
//!
//! The gap policy has no default: an operator must decide what a stuck
//! worldline means for their sources.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use worldline_core::primitives::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_GAP_TIMEOUT_MS,
    DEFAULT_RESOLVE_ATTEMPTS, DEFAULT_SHARD_COUNT, MAX_SHARD_COUNT,
};
use worldline_core::{
    BlobResolver, BlobStore, ClassPolicy, FsBlobStore, GapPolicy, MemoryBlobStore, Phase,
    PolicyTable, RegistryError, RegistryOptions, RelType, RetryPolicy, ShardConfig, StoreLayout,
};

/// Maximum configuration file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Default interval between gap checks.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

// =============================================================================
// SECTIONS
// =============================================================================

/// Storage backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-memory maps, lost on exit.
    #[default]
    Memory,
    /// One redb file per shard.
    Redb,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redb => f.write_str("redb"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Directory holding the shard files. Required for `redb`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_gap_timeout")]
    pub gap_timeout_ms: u64,
    pub gap_policy: GapPolicy,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Root of a content-addressed blob directory. Without it blobs are
    /// looked up in an empty in-memory store and stay unresolved.
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RESOLVE_ATTEMPTS,
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
            max_delay_ms: DEFAULT_BACKOFF_MAX_MS,
            blob_dir: None,
        }
    }
}

impl ResolverConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// One `[[classes]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassConfig {
    pub id: String,
    pub phases: Vec<String>,
    #[serde(default)]
    pub initial: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<(String, String)>,
    #[serde(default)]
    pub rel_types: Vec<String>,
}

impl ClassConfig {
    #[must_use]
    pub fn to_policy(&self) -> ClassPolicy {
        let mut policy = ClassPolicy::new(self.id.as_str(), self.phases.iter().map(String::as_str));
        for phase in &self.initial {
            policy = policy.with_initial(Phase::from(phase.as_str()));
        }
        for (from, to) in &self.transitions {
            policy = policy.with_transition(from.as_str(), to.as_str());
        }
        for rel_type in &self.rel_types {
            policy = policy.with_rel_type(RelType::from(rel_type.as_str()));
        }
        policy
    }
}

fn default_shards() -> usize {
    DEFAULT_SHARD_COUNT
}

fn default_gap_timeout() -> u64 {
    DEFAULT_GAP_TIMEOUT_MS
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_attempts() -> u32 {
    DEFAULT_RESOLVE_ATTEMPTS
}

fn default_base_delay() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_max_delay() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

// =============================================================================
// CONFIG
// =============================================================================

/// A whole configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub classes: Vec<ClassConfig>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            RegistryError::Io(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(RegistryError::Config(format!(
                "config file {} bytes exceeds maximum {} bytes",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::Io(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(text: &str) -> Result<Self, RegistryError> {
        let config: Self =
            toml::from_str(text).map_err(|e| RegistryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.ingest.shards == 0 || self.ingest.shards > MAX_SHARD_COUNT {
            return Err(RegistryError::Config(format!(
                "ingest.shards must be between 1 and {MAX_SHARD_COUNT}, got {}",
                self.ingest.shards
            )));
        }
        if self.ingest.tick_interval_ms == 0 {
            return Err(RegistryError::Config(
                "ingest.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.storage.backend == BackendKind::Redb && self.storage.path.is_none() {
            return Err(RegistryError::Config(
                "storage.path is required for the redb backend".to_string(),
            ));
        }
        self.resolver.retry_policy().validate()?;
        self.policies()?;
        Ok(())
    }

    /// The class policy table declared by `[[classes]]`.
    pub fn policies(&self) -> Result<PolicyTable, RegistryError> {
        PolicyTable::from_policies(self.classes.iter().map(ClassConfig::to_policy))
    }

    #[must_use]
    pub fn layout(&self) -> StoreLayout {
        match (self.storage.backend, &self.storage.path) {
            (BackendKind::Redb, Some(dir)) => StoreLayout::Redb { dir: dir.clone() },
            _ => StoreLayout::Memory,
        }
    }

    #[must_use]
    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            gap_timeout_ms: self.ingest.gap_timeout_ms,
            ..ShardConfig::new(self.ingest.gap_policy)
        }
    }

    #[must_use]
    pub fn resolver(&self) -> BlobResolver {
        let store: Arc<dyn BlobStore> = match &self.resolver.blob_dir {
            Some(dir) => Arc::new(FsBlobStore::new(dir.clone())),
            None => Arc::new(MemoryBlobStore::new()),
        };
        BlobResolver::new(store, self.resolver.retry_policy())
    }

    /// Everything `Registry::open` needs.
    pub fn registry_options(&self) -> Result<RegistryOptions, RegistryError> {
        Ok(RegistryOptions {
            shards: self.ingest.shards,
            layout: self.layout(),
            shard: self.shard_config(),
            policies: self.policies()?,
            resolver: self.resolver(),
        })
    }

    /// The same registry, volatile. Used to rebuild a store for verification.
    pub fn in_memory_options(&self, shards: usize) -> Result<RegistryOptions, RegistryError> {
        Ok(RegistryOptions {
            shards,
            layout: StoreLayout::Memory,
            ..self.registry_options()?
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
