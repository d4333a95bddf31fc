//! Tile scheduling across local worker pools and a shared broker.
//!
//! The [`pool::WorkerPoolCoordinator`] drives worker units from a
//! [`source::WorkSource`]. Three dispatchers wire it up for each topology:
//! [`local::SingleProcessDispatcher`] (in-memory FIFO),
//! [`client::ClientDispatcher`] (leases from the broker) and
//! [`server::ServerAggregator`] (publishes jobs and aggregates results).

pub mod client;
pub mod config;
pub mod error;
pub mod local;
pub mod pool;
pub mod server;
pub mod source;
pub mod worker;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use pool::PoolOutcome;
