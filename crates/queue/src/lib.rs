//! beanstalkd-compatible work-queue client.
//!
//! Provides the wire codec, a pipelined [`QueueClient`] session with tube
//! bookkeeping, fixed-interval reconnection and YAML stats parsing. The
//! `fake-broker` feature adds an in-memory broker for tests.

pub mod client;
pub mod codec;
pub mod error;
#[cfg(feature = "fake-broker")]
pub mod fake;
pub mod protocol;
pub mod reconnect;
pub mod stats;

pub use client::{Job, QueueClient, DEFAULT_TUBE};
pub use error::QueueError;
