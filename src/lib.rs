//! Core engine for a structure-aware, stateful network-protocol fuzzer.
//!
//! A [`model::Plugin`] declares a protocol's wire format, its optional state
//! machine, connection and heartbeat behavior, and what it exports into a
//! shared [`context::ProtocolContext`]. [`control::Engine`] loads plugins,
//! runs campaigns against a target, and persists anything interesting it
//! finds.
//!
//! # Quick start
//!
//! ```no_run
//! use fuzzcore::config::Config;
//! use fuzzcore::control::Engine;
//! use fuzzcore::session::FuzzingStrategy;
//!
//! # async fn run() -> fuzzcore::error::EngineResult<()> {
//! let engine = Engine::new(Config::default())?;
//! let session_id = engine
//!     .create_session("echo", "127.0.0.1:9000".into(), FuzzingStrategy::Random, None)
//!     .await?;
//! engine.start_session(&session_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod behavior;
pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod context;
pub mod control;
pub mod error;
pub mod heartbeat;
pub mod model;
pub mod mutate;
pub mod orchestrator;
pub mod parser;
pub mod plugin_loader;
pub mod response;
pub mod rng;
pub mod session;
pub mod stage;

pub use config::Config;
pub use control::Engine;
pub use error::{EngineError, EngineResult};
pub use model::Plugin;
pub use orchestrator::{Finding, Outcome};

/// Crate version, re-exported for diagnostics/health-check style output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
