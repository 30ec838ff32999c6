//! modgate Bridge Framework
//!
//! Common abstractions for running a bridge between a device protocol and
//! the Zenoh bus.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`Publisher`] for publishing raw payloads and JSON documents to Zenoh
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for standardized status reporting
//!
//! # Example
//!
//! ```ignore
//! use modgate_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new("mybridge", config).await?;
//!
//!     // Spawn protocol-specific workers
//!     let shutdown = runner.shutdown_token();
//!     runner.spawn(my_worker(runner.publisher(), shutdown));
//!
//!     // Run until Ctrl+C
//!     runner.run().await
//! }
//! ```

mod args;
mod config;
mod error;
mod publisher;
mod runner;
mod status;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use publisher::Publisher;
pub use runner::BridgeRunner;
pub use status::{BridgeStatus, StatusPublisher};

// Re-export commonly used types from modgate-common
pub use modgate_common::{LogFormat, LoggingConfig, ZenohConfig};
