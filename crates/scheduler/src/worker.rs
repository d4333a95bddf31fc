//! Worker units.
//!
//! A worker is a tokio task that owns its [`FrameInfo`] once initialised
//! and renders one tile at a time on the blocking pool. It talks to the
//! coordinator only through messages: [`WorkerMessage`] in over a private
//! channel, [`WorkerEvent`] out over a channel shared by all workers.

use std::sync::Arc;

use tessera_core::kernel::RenderKernel;
use tessera_core::types::{FrameInfo, JobId, Tile, WorkerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Coordinator to worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// One-time frame setup, sent right before a worker's first job.
    Init {
        worker_id: WorkerId,
        worker_count: usize,
        width: u32,
        height: u32,
        seed: String,
    },
    Work {
        job_id: JobId,
        tile: Tile,
    },
}

/// Worker to coordinator: a rendered tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub tile: Tile,
    /// `tile.width * tile.height` RGBA pixels.
    pub pixels: Vec<u8>,
}

/// Worker to coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Completed(Completion),
    /// The kernel panicked on `job_id`. The worker stays up and is free
    /// for the next job.
    Failed {
        worker_id: WorkerId,
        job_id: JobId,
        reason: String,
    },
}

/// Coordinator-side handle to a spawned worker task.
pub struct WorkerUnit {
    pub(crate) tx: mpsc::UnboundedSender<WorkerMessage>,
    pub(crate) task: JoinHandle<()>,
}

impl WorkerUnit {
    /// Spawn a worker task rendering with `kernel` and reporting to
    /// `events`.
    pub fn spawn(
        worker_id: WorkerId,
        kernel: Arc<dyn RenderKernel>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(worker_loop(worker_id, rx, kernel, events));
        Self { tx, task }
    }

    pub fn send(&self, message: WorkerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Process messages until the coordinator closes the channel.
///
/// `Work` arriving before `Init` is dropped with a warning; the coordinator
/// never sends it in that order.
pub async fn worker_loop(
    worker_id: WorkerId,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    kernel: Arc<dyn RenderKernel>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    tracing::trace!(worker_id, "Worker started");
    let mut frame: Option<Arc<FrameInfo>> = None;

    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Init {
                worker_count,
                width,
                height,
                seed,
                ..
            } => {
                tracing::debug!(worker_id, worker_count, width, height, seed = %seed, "Worker initialised");
                frame = Some(Arc::new(FrameInfo {
                    width,
                    height,
                    seed,
                }));
            }
            WorkerMessage::Work { job_id, tile } => {
                let Some(frame) = frame.clone() else {
                    tracing::warn!(worker_id, job_id, "Work received before init, dropping");
                    continue;
                };
                let kernel = Arc::clone(&kernel);
                let rendered =
                    tokio::task::spawn_blocking(move || kernel.render(&frame, &tile)).await;

                let event = match rendered {
                    Ok(pixels) => WorkerEvent::Completed(Completion {
                        worker_id,
                        job_id,
                        tile,
                        pixels,
                    }),
                    Err(e) => {
                        tracing::error!(worker_id, job_id, error = %e, "Kernel failed on tile");
                        WorkerEvent::Failed {
                            worker_id,
                            job_id,
                            reason: e.to_string(),
                        }
                    }
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        }
    }

    tracing::trace!(worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::kernel::SkyKernel;

    fn tile() -> Tile {
        Tile {
            x: 0,
            y: 0,
            width: 4,
            height: 2,
            sampling: 1,
        }
    }

    #[tokio::test]
    async fn renders_after_init() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let unit = WorkerUnit::spawn(3, Arc::new(SkyKernel), done_tx);

        assert!(unit.send(WorkerMessage::Init {
            worker_id: 3,
            worker_count: 4,
            width: 8,
            height: 8,
            seed: "world".into(),
        }));
        assert!(unit.send(WorkerMessage::Work {
            job_id: 11,
            tile: tile(),
        }));

        let Some(WorkerEvent::Completed(completion)) = done_rx.recv().await else {
            panic!("expected a completion");
        };
        assert_eq!(completion.worker_id, 3);
        assert_eq!(completion.job_id, 11);
        assert_eq!(completion.pixels.len(), tile().buffer_len());

        drop(unit.tx);
        unit.task.await.unwrap();
    }

    #[tokio::test]
    async fn work_before_init_is_dropped() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let unit = WorkerUnit::spawn(0, Arc::new(SkyKernel), done_tx);

        unit.send(WorkerMessage::Work {
            job_id: 1,
            tile: tile(),
        });
        drop(unit.tx);
        unit.task.await.unwrap();

        assert!(done_rx.recv().await.is_none());
    }

    struct PanickyKernel;

    impl RenderKernel for PanickyKernel {
        fn identity(&self) -> String {
            "panicky/1".to_string()
        }

        fn render(&self, _frame: &FrameInfo, tile: &Tile) -> Vec<u8> {
            if tile.x == 0 {
                panic!("kernel blew up");
            }
            vec![0; tile.buffer_len()]
        }
    }

    #[tokio::test]
    async fn kernel_panic_is_reported_and_worker_survives() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let unit = WorkerUnit::spawn(2, Arc::new(PanickyKernel), done_tx);

        unit.send(WorkerMessage::Init {
            worker_id: 2,
            worker_count: 1,
            width: 8,
            height: 8,
            seed: "world".into(),
        });
        unit.send(WorkerMessage::Work {
            job_id: 5,
            tile: tile(),
        });
        unit.send(WorkerMessage::Work {
            job_id: 6,
            tile: Tile { x: 4, ..tile() },
        });

        assert_matches::assert_matches!(
            done_rx.recv().await,
            Some(WorkerEvent::Failed { worker_id: 2, job_id: 5, .. })
        );
        assert_matches::assert_matches!(
            done_rx.recv().await,
            Some(WorkerEvent::Completed(Completion { job_id: 6, .. }))
        );
        assert!(!unit.is_finished());

        drop(unit.tx);
        unit.task.await.unwrap();
    }
}
