//! # Worldline CLI Module
//!
//! This module implements the CLI interface for Worldline.
//!
//! ## Available Commands
//!
//! - `server` - Start the shard workers and the HTTP server
//! - `init` - Write a starter config or create the shard stores
//! - `status` - Show counts and counters
//! - `ingest` - Ingest events from a file
//! - `query` - Read current state, history, neighbors or an index page
//! - `verify` - Replay the event log into memory and compare checksums
//! - `export` - Write the canonical snapshot to a file
//! - `hash` - Print the canonical snapshot checksum

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use worldline_core::RegistryError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Worldline - Asset State Registry
///
/// Projects identity-scoped events into versioned worldlines, class-governed
/// lifecycles and a typed entanglement graph.
#[derive(Parser, Debug)]
#[command(name = "worldline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the TOML configuration
    #[arg(short = 'c', long, global = true, default_value = "worldline.toml")]
    pub config: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start shard workers and the HTTP server
    Server {
        /// Host to bind to (overrides [server].host)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Write a starter config if none exists, otherwise create the shard stores
    Init {
        /// Remove existing shard stores first
        #[arg(short, long)]
        force: bool,
    },

    /// Show counts and counters
    Status,

    /// Ingest events from a file
    Ingest {
        /// Path to the input file
        #[arg(short, long)]
        file: PathBuf,

        /// Input format (json: one array, jsonl: one event per line)
        #[arg(short = 't', long, default_value = "json")]
        format: String,
    },

    /// Query the registry
    Query {
        #[command(subcommand)]
        query: QueryCommand,
    },

    /// Replay the event log into a fresh in-memory registry and compare
    Verify {
        /// Shard count of the rebuilt registry (default: configured count)
        #[arg(short, long)]
        shards: Option<usize>,

        /// Events per replay batch
        #[arg(short, long, default_value = "1000")]
        batch: usize,

        /// Also check this exported snapshot against the live state
        #[arg(short = 'x', long)]
        snapshot: Option<PathBuf>,
    },

    /// Export the canonical snapshot
    Export {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the BLAKE3 checksum of the canonical snapshot
    Hash,
}

/// Read operations.
#[derive(Subcommand, Debug)]
pub enum QueryCommand {
    /// Current state of a worldline
    Current { id: String },

    /// Every version of a worldline
    History { id: String },

    /// Active outgoing edges of a worldline
    Neighbors {
        id: String,

        /// Only this relationship type
        #[arg(short, long)]
        rel_type: Option<String>,
    },

    /// Worldlines of a class currently in a phase
    Find {
        #[arg(long)]
        class: String,

        #[arg(long)]
        phase: String,

        /// Continue after this worldline id
        #[arg(long)]
        after: Option<String>,

        /// Page size
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), RegistryError> {
    let config = cli.config.as_path();
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Server { host, port }) => cmd_server(config, host, port).await,
        Some(Commands::Init { force }) => cmd_init(config, force),
        Some(Commands::Status) | None => cmd_status(config, json_mode),
        Some(Commands::Ingest { file, format }) => cmd_ingest(config, json_mode, &file, &format),
        Some(Commands::Query { query }) => cmd_query(config, json_mode, query),
        Some(Commands::Verify {
            shards,
            batch,
            snapshot,
        }) => cmd_verify(config, json_mode, shards, batch, snapshot.as_deref()),
        Some(Commands::Export { output }) => cmd_export(config, &output),
        Some(Commands::Hash) => cmd_hash(config, json_mode),
    }
}
