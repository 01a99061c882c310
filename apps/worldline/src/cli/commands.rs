//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.
//!
//! Every command except `server` drives the registry synchronously from the
//! calling thread; `server` hands the shards to worker threads.

use crate::api::{self, AppState};
use crate::config::{BackendKind, Config};
use crate::pipeline::{Clock, Pipeline};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use worldline_core::primitives::MAX_BATCH_LENGTH;
use worldline_core::{
    Admission, ApplyResult, CanonicalSnapshot, ClassId, IngestOutcome, IngestedEvent, Phase,
    Registry, RegistryError, RelType, StoreLayout, WorldlineId, canonical_checksum, replay,
    verify_export,
};

use super::QueryCommand;

/// Starter configuration written by `init`.
const CONFIG_TEMPLATE: &str = include_str!("../../worldline.example.toml");

// =============================================================================
// FILE LIMITS
// =============================================================================

/// Maximum event file size for ingestion (100 MB).
const MAX_INGEST_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum snapshot file size for verification (500 MB).
const MAX_SNAPSHOT_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Canonicalize an input path and check it is a regular file within `max_size`.
fn validate_input_file(path: &Path, max_size: u64) -> Result<PathBuf, RegistryError> {
    let canonical = path.canonicalize().map_err(|e| {
        RegistryError::Io(format!("invalid file path '{}': {}", path.display(), e))
    })?;
    if !canonical.is_file() {
        return Err(RegistryError::Io(format!(
            "path '{}' is not a regular file",
            path.display()
        )));
    }
    let size = std::fs::metadata(&canonical)
        .map_err(|e| RegistryError::Io(format!("cannot read file metadata: {}", e)))?
        .len();
    if size > max_size {
        return Err(RegistryError::Serialization(format!(
            "file size {} bytes exceeds maximum allowed {} bytes",
            size, max_size
        )));
    }
    Ok(canonical)
}

/// Resolve an output path against its canonical parent directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, RegistryError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let canonical_parent = parent.canonicalize().map_err(|e| {
        RegistryError::Io(format!(
            "invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;
    if !canonical_parent.is_dir() {
        return Err(RegistryError::Io(format!(
            "output directory '{}' is not a directory",
            parent.display()
        )));
    }
    let filename = path
        .file_name()
        .ok_or_else(|| RegistryError::Io("output path has no filename".to_string()))?;
    Ok(canonical_parent.join(filename))
}

fn print_json(value: &impl Serialize) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// REGISTRY LOADING
// =============================================================================

/// Open the registry described by a configuration.
pub fn open_registry(config: &Config) -> Result<Registry, RegistryError> {
    if config.storage.backend == BackendKind::Memory {
        tracing::warn!("memory backend: state does not outlive this process");
    }
    Registry::open(config.registry_options()?)
}

fn load(config_path: &Path) -> Result<(Config, Registry), RegistryError> {
    let config = Config::load(config_path)?;
    let registry = open_registry(&config)?;
    Ok((config, registry))
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the shard workers and serve the HTTP API.
pub async fn cmd_server(
    config_path: &Path,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), RegistryError> {
    let (config, registry) = load(config_path)?;
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let pipeline = Pipeline::start(registry, config.ingest.tick_interval_ms)?;

    println!("Worldline Registry Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:       {}", host);
    println!("  Port:       {}", port);
    println!("  Backend:    {}", config.storage.backend);
    println!("  Shards:     {}", config.ingest.shards);
    println!("  Gap policy: {:?}", config.ingest.gap_policy);
    println!("  Classes:    {}", config.classes.len());
    println!();
    println!("Endpoints:");
    println!("  POST /events              - Ingest one event");
    println!("  POST /events/batch        - Ingest a batch");
    println!("  GET  /worldlines/{{id}}     - Current state");
    println!("  GET  /find                - Worldlines by class and phase");
    println!("  GET  /status              - Counts and counters");
    println!("  GET  /hash                - Canonical checksum");
    println!("  GET  /health              - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let state = AppState::new(Arc::new(pipeline), config.storage.backend.to_string());
    api::run_server(&format!("{}:{}", host, port), state).await
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Write a starter config when none exists; otherwise create the shard
/// stores the config describes.
pub fn cmd_init(config_path: &Path, force: bool) -> Result<(), RegistryError> {
    if !config_path.exists() {
        let target = validate_output_path(config_path)?;
        std::fs::write(&target, CONFIG_TEMPLATE)
            .map_err(|e| RegistryError::Io(format!("cannot write config: {}", e)))?;
        println!("Wrote starter configuration to {:?}", target);
        println!("Review [ingest].gap_policy and [[classes]], then run init again.");
        return Ok(());
    }

    let config = Config::load(config_path)?;
    let StoreLayout::Redb { dir } = config.layout() else {
        println!("Memory backend configured: nothing to initialize");
        return Ok(());
    };

    let existing: Vec<PathBuf> = (0..config.ingest.shards)
        .map(|shard| StoreLayout::shard_path(&dir, shard))
        .filter(|path| path.exists())
        .collect();
    if !existing.is_empty() {
        if !force {
            return Err(RegistryError::Config(format!(
                "{} shard store(s) already exist in {:?} (use --force to reinitialize)",
                existing.len(),
                dir
            )));
        }
        for path in &existing {
            std::fs::remove_file(path)
                .map_err(|e| RegistryError::Io(format!("cannot remove {:?}: {}", path, e)))?;
        }
        tracing::warn!(removed = existing.len(), "existing shard stores removed");
    }

    let registry = Registry::open(config.registry_options()?)?;
    println!(
        "Initialized {} redb shard store(s) in {:?}",
        registry.router().shards(),
        dir
    );
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show counts and counters.
pub fn cmd_status(config_path: &Path, json_mode: bool) -> Result<(), RegistryError> {
    let (config, registry) = load(config_path)?;
    let stats = registry.query().stats()?;

    if json_mode {
        print_json(&serde_json::json!({
            "config": config_path.to_string_lossy(),
            "backend": config.storage.backend.to_string(),
            "gap_policy": config.ingest.gap_policy,
            "stats": stats,
        }));
        return Ok(());
    }

    println!("Worldline Registry Status");
    println!("=========================");
    println!("Config:      {:?}", config_path);
    println!("Backend:     {}", config.storage.backend);
    println!("Shards:      {}", stats.shards);
    println!();
    println!("Worldlines:  {}", stats.counts.worldlines);
    println!("Versions:    {}", stats.counts.versions);
    println!("Edges:       {}", stats.counts.edges);
    println!("Events:      {}", stats.counts.events);
    println!();
    println!("Rejections:  {}", registry.query().rejections()?.len());
    println!("Anomalies:   {}", registry.query().anomalies()?.len());
    Ok(())
}

// =============================================================================
// INGEST COMMAND
// =============================================================================

/// Outcome counts of an ingestion run.
#[derive(Debug, Default, Serialize)]
struct IngestTally {
    submitted: usize,
    applied: usize,
    rejected: usize,
    refused: usize,
    buffered: usize,
    deduplicated: usize,
    still_buffered: usize,
}

impl IngestTally {
    fn record(&mut self, outcome: &IngestOutcome) {
        self.submitted += 1;
        match outcome {
            IngestOutcome::Accepted(Admission::Applied(reports)) => {
                for report in reports {
                    match &report.result {
                        ApplyResult::Applied(_) => self.applied += 1,
                        ApplyResult::Rejected(e) => {
                            self.rejected += 1;
                            tracing::warn!(event_id = %report.event_id, error = %e, "rejected");
                        }
                    }
                }
            }
            IngestOutcome::Accepted(Admission::Buffered { .. }) => self.buffered += 1,
            IngestOutcome::Deduplicated => self.deduplicated += 1,
            IngestOutcome::Rejected(e) => {
                self.refused += 1;
                tracing::warn!(error = %e, "refused");
            }
        }
    }
}

/// Parse an event file.
fn parse_events(contents: &[u8], format: &str) -> Result<Vec<IngestedEvent>, RegistryError> {
    match format {
        "json" => serde_json::from_slice(contents)
            .map_err(|e| RegistryError::Serialization(format!("invalid event file: {}", e))),
        "jsonl" => String::from_utf8_lossy(contents)
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    RegistryError::Serialization(format!("line {}: {}", n + 1, e))
                })
            })
            .collect(),
        other => Err(RegistryError::Serialization(format!(
            "unknown format: {}",
            other
        ))),
    }
}

/// Ingest events from a file, in file order.
pub fn cmd_ingest(
    config_path: &Path,
    json_mode: bool,
    file: &Path,
    format: &str,
) -> Result<(), RegistryError> {
    let (_config, mut registry) = load(config_path)?;
    let path = validate_input_file(file, MAX_INGEST_FILE_SIZE)?;
    tracing::info!("ingesting from {:?} (format: {})", path, format);

    let contents = std::fs::read(&path)
        .map_err(|e| RegistryError::Io(format!("cannot read {:?}: {}", path, e)))?;
    let events = parse_events(&contents, format)?;

    let clock = Clock::start();
    let mut tally = IngestTally::default();
    let mut events = events.into_iter().peekable();
    while events.peek().is_some() {
        let chunk: Vec<IngestedEvent> = events.by_ref().take(MAX_BATCH_LENGTH).collect();
        for outcome in registry.ingest_batch(chunk, clock.now_ms())? {
            tally.record(&outcome);
        }
    }
    tally.still_buffered = registry.buffered();

    if json_mode {
        print_json(&tally);
    } else {
        println!("Submitted {} events", tally.submitted);
        println!(
            "  applied {}, rejected {}, refused {}, buffered {}, deduplicated {}",
            tally.applied, tally.rejected, tally.refused, tally.buffered, tally.deduplicated
        );
    }
    if tally.still_buffered > 0 {
        tracing::warn!(
            buffered = tally.still_buffered,
            "events still wait for missing sequences and are dropped on exit; redeliver them once the gap is filled"
        );
    }
    Ok(())
}

// =============================================================================
// QUERY COMMAND
// =============================================================================

/// Execute a read.
pub fn cmd_query(
    config_path: &Path,
    json_mode: bool,
    query: QueryCommand,
) -> Result<(), RegistryError> {
    let (_config, registry) = load(config_path)?;
    let service = registry.query();

    match query {
        QueryCommand::Current { id } => {
            let current = service.get_current(&WorldlineId::from(id))?;
            if json_mode {
                print_json(&current);
                return Ok(());
            }
            let v = &current.version;
            println!("Worldline {} ({})", current.worldline.id, current.worldline.class);
            println!("  Anchor:    {}", current.worldline.anchor);
            println!("  Phase:     {}", v.phase);
            println!("  Version:   {} ({})", v.sequence, v.status.name());
            println!("  Degraded:  {}", current.degraded);
            for (attribute, value) in &v.frequency {
                println!("  {} = {}", attribute, value);
            }
            if !v.polarization.is_empty() {
                let tags: Vec<&str> = v.polarization.iter().map(String::as_str).collect();
                println!("  Tags:      {}", tags.join(", "));
            }
        }

        QueryCommand::History { id } => {
            let history = service.get_history(&WorldlineId::from(id.as_str()))?;
            if json_mode {
                print_json(&history);
                return Ok(());
            }
            println!("History of {} ({} versions):", id, history.len());
            for v in &history {
                println!(
                    "  #{:<4} {:<20} {:<18} event {} at {}",
                    v.sequence,
                    v.phase.as_str(),
                    v.status.name(),
                    v.event_id,
                    v.timestamp
                );
            }
        }

        QueryCommand::Neighbors { id, rel_type } => {
            let rel_type = rel_type.map(RelType::from);
            let edges = service.get_neighbors(&WorldlineId::from(id.as_str()), rel_type.as_ref())?;
            if json_mode {
                print_json(&edges);
                return Ok(());
            }
            println!("Neighbors of {} ({}):", id, edges.len());
            for e in &edges {
                println!("  -[{}]-> {} (since {})", e.rel_type, e.target, e.created_at);
            }
        }

        QueryCommand::Find {
            class,
            phase,
            after,
            limit,
        } => {
            let after = after.map(WorldlineId::from);
            let page = service.find_by_class_and_phase(
                &ClassId::from(class.as_str()),
                &Phase::from(phase.as_str()),
                after.as_ref(),
                limit,
            )?;
            if json_mode {
                print_json(&page);
                return Ok(());
            }
            println!("{} in {} ({} shown):", class, phase, page.items.len());
            for id in &page.items {
                println!("  {}", id);
            }
            if let Some(next) = &page.next {
                println!("More: --after {}", next);
            }
        }
    }

    Ok(())
}

// =============================================================================
// VERIFY COMMAND
// =============================================================================

/// Replay the persisted event log into memory and compare checksums.
pub fn cmd_verify(
    config_path: &Path,
    json_mode: bool,
    shards: Option<usize>,
    batch: usize,
    snapshot: Option<&Path>,
) -> Result<(), RegistryError> {
    let (config, registry) = load(config_path)?;
    let shards = shards.unwrap_or(config.ingest.shards);

    let live = canonical_checksum(registry.query())?;
    let mut rebuilt = Registry::open(config.in_memory_options(shards)?)?;
    let report = replay(registry.query(), &mut rebuilt, batch)?;
    let replayed = canonical_checksum(rebuilt.query())?;

    let snapshot_ok = match snapshot {
        Some(path) => {
            let path = validate_input_file(path, MAX_SNAPSHOT_FILE_SIZE)?;
            let data = std::fs::read(&path)
                .map_err(|e| RegistryError::Io(format!("cannot read {:?}: {}", path, e)))?;
            Some(verify_export(registry.query(), &data)?)
        }
        None => None,
    };
    let matches = live == replayed && snapshot_ok.unwrap_or(true);

    if json_mode {
        print_json(&serde_json::json!({
            "live": live.to_hex(),
            "replayed": replayed.to_hex(),
            "shards": shards,
            "replay": report,
            "snapshot_matches": snapshot_ok,
            "matches": matches,
        }));
    } else {
        println!("Replayed {} events in {} batches", report.events, report.batches);
        println!("  applied {}, rejected {}", report.applied, report.rejected);
        println!("Live:     {}", live);
        println!("Replayed: {}", replayed);
        if let Some(ok) = snapshot_ok {
            println!("Snapshot: {}", if ok { "matches" } else { "DIFFERS" });
        }
    }

    if matches {
        tracing::info!(checksum = %live, "verification passed");
        Ok(())
    } else {
        Err(RegistryError::Serialization(
            "verification failed: rebuilt state differs".to_string(),
        ))
    }
}

// =============================================================================
// EXPORT / HASH COMMANDS
// =============================================================================

/// Write the canonical snapshot to a file.
pub fn cmd_export(config_path: &Path, output: &Path) -> Result<(), RegistryError> {
    let (_config, registry) = load(config_path)?;
    let output = validate_output_path(output)?;

    let snapshot = CanonicalSnapshot::capture(registry.query())?;
    let data = snapshot.export()?;
    std::fs::write(&output, &data)
        .map_err(|e| RegistryError::Io(format!("cannot write {:?}: {}", output, e)))?;

    println!("Exported {} bytes to {:?}", data.len(), output);
    println!(
        "  {} worldlines, {} versions, {} edges",
        snapshot.entries.len(),
        snapshot.versions.len(),
        snapshot.edges.len()
    );
    println!("Checksum: {}", snapshot.checksum()?);
    Ok(())
}

/// Print the canonical checksum.
pub fn cmd_hash(config_path: &Path, json_mode: bool) -> Result<(), RegistryError> {
    let (_config, registry) = load(config_path)?;
    let checksum = canonical_checksum(registry.query())?;
    if json_mode {
        print_json(&serde_json::json!({ "checksum": checksum.to_hex() }));
    } else {
        println!("{}", checksum);
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn template_is_a_valid_config() {
        let config = Config::from_toml(CONFIG_TEMPLATE).unwrap();
        assert!(!config.classes.is_empty());
    }

    #[test]
    fn parse_json_and_jsonl() {
        let a = IngestedEvent::create("c-1", "ledger", 1, "GOLD_VAULT", "SKR-1", "0,0");
        let b = IngestedEvent::create("c-2", "ledger", 2, "GOLD_VAULT", "SKR-2", "0,0");

        let json = serde_json::to_vec(&vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(parse_events(&json, "json").unwrap(), vec![a.clone(), b.clone()]);

        let lines = format!(
            "{}\n\n{}\n",
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        assert_eq!(parse_events(lines.as_bytes(), "jsonl").unwrap(), vec![a, b]);

        assert!(parse_events(b"[]", "xml").is_err());
        assert!(parse_events(b"{not json}\n", "jsonl").is_err());
    }

    #[test]
    fn init_writes_template_then_creates_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("worldline.toml");
        cmd_init(&config_path, false).unwrap();
        assert!(config_path.exists());

        let data = dir.path().join("data");
        let text = format!(
            "[storage]\nbackend = \"redb\"\npath = {:?}\n\n{}",
            data.to_string_lossy(),
            CONFIG_TEMPLATE
                .lines()
                .skip_while(|l| !l.starts_with("[ingest]"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        std::fs::write(&config_path, text).unwrap();

        cmd_init(&config_path, false).unwrap();
        assert!(StoreLayout::shard_path(&data, 0).exists());
        assert!(matches!(
            cmd_init(&config_path, false),
            Err(RegistryError::Config(_))
        ));
        cmd_init(&config_path, true).unwrap();
    }

    #[test]
    fn output_path_needs_existing_parent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_output_path(&dir.path().join("out.wlsn")).is_ok());
        assert!(validate_output_path(&dir.path().join("missing/out.wlsn")).is_err());
    }
}
