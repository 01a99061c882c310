//! # Worldline - Asset State Registry
//!
//! The main binary for the Worldline registry.
//!
//! This application provides:
//! - Shard workers (one thread per shard, the only writers)
//! - HTTP REST API server (axum-based)
//! - CLI interface for registry operations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    apps/worldline (THE BINARY)                  │
//! │                                                                 │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐    │
//! │  │   CLI       │    │   HTTP API  │    │  Shard Workers   │    │
//! │  │  (clap)     │    │   (axum)    │    │  (std threads)   │    │
//! │  └──────┬──────┘    └──────┬──────┘    └────────┬─────────┘    │
//! │         │                  │                    │              │
//! │         └──────────────────┼────────────────────┘              │
//! │                            ▼                                   │
//! │                   ┌────────────────┐                           │
//! │                   │ worldline-core │                           │
//! │                   │ (THE REGISTRY) │                           │
//! │                   └────────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Write a starter config, edit it, then create the shard stores
//! worldline init
//! worldline init
//!
//! # Start the HTTP server
//! worldline server --host 0.0.0.0 --port 8080
//!
//! # CLI operations
//! worldline ingest -f events.json
//! worldline query current wl-...
//! worldline verify
//! ```

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worldline::cli;

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // WORLDLINE_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("WORLDLINE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let default_filter = if cli.verbose {
        "worldline=debug,worldline_core=debug,tower_http=debug"
    } else {
        "worldline=info,worldline_core=info,tower_http=debug"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    println!(
        r#"
  worldline v{}
  asset state registry

  deterministic | event-sourced | verifiable
"#,
        env!("CARGO_PKG_VERSION")
    );
}
