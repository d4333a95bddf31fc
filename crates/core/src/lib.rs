//! Shared domain types for the tile renderer.
//!
//! Provides frame decomposition, the refinement-aware output
//! accumulator, the result transport encoding, job payload formats and the
//! render-kernel contract used by every dispatcher mode.

pub mod accumulator;
pub mod encoding;
pub mod error;
pub mod hashing;
pub mod kernel;
pub mod payload;
pub mod tiles;
pub mod types;

pub use error::CoreError;
