//! Where a worker pool gets its work from.

use async_trait::async_trait;
use tessera_core::types::{JobId, Tile};

use crate::worker::Completion;

/// Result of asking a [`WorkSource`] for the next job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Work {
        job_id: JobId,
        tile: Tile,
        /// Seed carried by the job, used to initialise a worker that has
        /// not rendered anything yet. `None` falls back to the pool's seed.
        seed: Option<String>,
    },
    /// Nothing available right now.
    Empty,
    /// The job belongs to a different scene version; the process must
    /// restart with fresh code.
    Reload,
}

/// Supply side of a [`WorkerPoolCoordinator`](crate::pool::WorkerPoolCoordinator).
///
/// Failures are handled inside the source (logged, retried on a later
/// tick); the coordinator only sees acquisition outcomes.
#[async_trait]
pub trait WorkSource: Send {
    /// Called once at the start of every dispatch tick.
    async fn on_tick(&mut self) {}

    async fn acquire(&mut self) -> Acquisition;

    /// Extend the lease on a job a worker is still rendering.
    async fn keep_alive(&mut self, job_id: JobId);

    /// Take delivery of a finished tile.
    async fn complete(&mut self, completion: Completion);

    /// A worker failed on `job_id`; it will not be completed or kept
    /// alive by this pool.
    async fn abandon(&mut self, _job_id: JobId) {}

    /// True once no further work will ever be handed out.
    fn is_exhausted(&self) -> bool;
}
