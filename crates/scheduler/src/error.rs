use tessera_core::types::WorkerId;
use tessera_core::CoreError;
use tessera_queue::QueueError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// A worker task exited while the coordinator still needed it.
    #[error("Worker {0} is gone")]
    WorkerGone(WorkerId),
}
