//! # worldline
//!
//! The Worldline registry application: configuration, shard workers, HTTP
//! API and CLI around `worldline-core`.
//!
//! The binary in `main.rs` only parses arguments and sets up logging; every
//! piece is reachable from here so integration tests can drive it.

pub mod api;
pub mod cli;
pub mod config;
pub mod pipeline;

pub use config::Config;
pub use pipeline::Pipeline;
