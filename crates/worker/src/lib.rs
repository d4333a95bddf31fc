//! Tessera process entry points: environment configuration and topology
//! selection for the `tessera` binary.

pub mod app;
pub mod config;

pub use app::{run, RunOutcome};
pub use config::{ConfigError, Mode, RenderConfig};
