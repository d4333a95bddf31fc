//! Single-process topology: no broker, tiles come from an in-memory FIFO
//! and land straight in a local framebuffer.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::accumulator::{ApplyOutcome, OutputAccumulator};
use tessera_core::kernel::RenderKernel;
use tessera_core::tiles::decompose_frame;
use tessera_core::types::{JobId, Tile};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::pool::{PoolConfig, PoolOutcome, WorkerPoolCoordinator};
use crate::source::{Acquisition, WorkSource};
use crate::worker::Completion;

/// Ordered in-memory tile queue feeding a local accumulator.
#[derive(Debug)]
pub struct LocalSource {
    queue: VecDeque<Tile>,
    next_job: JobId,
    output: OutputAccumulator,
}

impl LocalSource {
    pub fn new(tiles: Vec<Tile>, width: u32, height: u32) -> Self {
        Self {
            queue: tiles.into(),
            next_job: 1,
            output: OutputAccumulator::new(width, height),
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn output(&self) -> &OutputAccumulator {
        &self.output
    }

    pub fn into_output(self) -> OutputAccumulator {
        self.output
    }
}

#[async_trait]
impl WorkSource for LocalSource {
    async fn acquire(&mut self) -> Acquisition {
        let Some(tile) = self.queue.pop_front() else {
            return Acquisition::Empty;
        };
        let job_id = self.next_job;
        self.next_job += 1;
        Acquisition::Work {
            job_id,
            tile,
            seed: None,
        }
    }

    async fn keep_alive(&mut self, _job_id: JobId) {}

    async fn complete(&mut self, completion: Completion) {
        match self.output.apply(&completion.tile, &completion.pixels) {
            Ok(ApplyOutcome::Applied) => {}
            Ok(ApplyOutcome::Superseded { stored }) => {
                tracing::debug!(
                    job_id = completion.job_id,
                    sampling = completion.tile.sampling,
                    stored,
                    "Tile superseded by a finer result",
                );
            }
            Err(e) => {
                tracing::warn!(job_id = completion.job_id, error = %e, "Dropping tile");
            }
        }
    }

    async fn abandon(&mut self, job_id: JobId) {
        // Not retried; the kernel is deterministic per tile.
        tracing::warn!(job_id, "Tile left unrendered");
    }

    fn is_exhausted(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Result of a single-process run.
#[derive(Debug)]
pub struct LocalRender {
    pub outcome: PoolOutcome,
    pub output: OutputAccumulator,
}

/// Renders a whole frame with local workers only.
pub struct SingleProcessDispatcher {
    config: SchedulerConfig,
    kernel: Arc<dyn RenderKernel>,
}

impl SingleProcessDispatcher {
    pub fn new(config: SchedulerConfig, kernel: Arc<dyn RenderKernel>) -> Self {
        Self { config, kernel }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<LocalRender, SchedulerError> {
        let tiles = decompose_frame(
            self.config.width,
            self.config.height,
            self.config.tile_size,
            self.config.levels,
        )?;
        tracing::info!(tiles = tiles.len(), "Rendering frame locally");

        let source = LocalSource::new(tiles, self.config.width, self.config.height);
        let pool_config = PoolConfig {
            worker_count: self.config.worker_count,
            frame: self.config.frame(),
            tick_interval: self.config.tick_interval,
        };
        let mut pool = WorkerPoolCoordinator::new(source, pool_config, Arc::clone(&self.kernel));
        let outcome = pool.run(cancel).await?;

        if let PoolOutcome::Finished { elapsed } = outcome {
            let secs = (elapsed.as_secs_f64() * 10.0).round() / 10.0;
            tracing::info!("Finish time: {secs}s");
        }

        Ok(LocalRender {
            outcome,
            output: pool.into_source().into_output(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::SamplingLevels;

    #[tokio::test]
    async fn source_hands_out_fifo_then_empty() {
        let tiles = decompose_frame(20, 10, 10, SamplingLevels::default()).unwrap();
        let first = tiles[0];
        let mut source = LocalSource::new(tiles, 20, 10);

        assert_eq!(source.remaining(), 4);
        assert_eq!(
            source.acquire().await,
            Acquisition::Work {
                job_id: 1,
                tile: first,
                seed: None
            }
        );
        for _ in 0..3 {
            assert!(matches!(source.acquire().await, Acquisition::Work { .. }));
        }
        assert!(source.is_exhausted());
        assert_eq!(source.acquire().await, Acquisition::Empty);
    }
}
