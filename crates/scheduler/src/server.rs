//! Server topology: publish one job per tile, then drain the result tube
//! into a framebuffer forever.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tessera_core::accumulator::{ApplyOutcome, OutputAccumulator};
use tessera_core::encoding::{decode_pixels, write_png};
use tessera_core::payload::{JobPayload, ResultPayload};
use tessera_core::tiles::decompose_frame;
use tessera_queue::{Job, QueueClient, QueueError, DEFAULT_TUBE};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// Counters for one pass over the result tube.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Results written into the framebuffer.
    pub applied: usize,
    /// Results ignored because a finer level was already stored.
    pub superseded: usize,
    /// Results from another scene version.
    pub discarded: usize,
    /// Results that could not be decoded or placed.
    pub failed: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.applied + self.superseded + self.discarded + self.failed
    }
}

pub struct ServerAggregator {
    client: Arc<QueueClient>,
    config: SchedulerConfig,
    output: OutputAccumulator,
    output_path: Option<PathBuf>,
}

impl ServerAggregator {
    pub fn new(client: Arc<QueueClient>, config: SchedulerConfig) -> Self {
        let output = OutputAccumulator::new(config.width, config.height);
        Self {
            client,
            config,
            output,
            output_path: None,
        }
    }

    /// Write the framebuffer to `path` after every drain that changed it.
    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn output(&self) -> &OutputAccumulator {
        &self.output
    }

    /// Delete every ready, delayed and buried job on `tube`. Leaves `tube`
    /// selected for producing. Returns the number of jobs removed; jobs
    /// that vanish between peek and delete are skipped.
    pub async fn clear_tube(&self, tube: &str) -> Result<usize, SchedulerError> {
        self.client.use_tube(tube).await?;

        let mut removed = 0;
        for kind in ["ready", "delayed", "buried"] {
            loop {
                let peeked = match kind {
                    "ready" => self.client.peek_ready().await,
                    "delayed" => self.client.peek_delayed().await,
                    _ => self.client.peek_buried().await,
                };
                let job = match peeked {
                    Ok(job) => job,
                    Err(e) if e.is_not_found() => break,
                    Err(e) => return Err(e.into()),
                };
                match self.client.delete(job.id).await {
                    Ok(()) => removed += 1,
                    // Leased or deleted by someone else since the peek.
                    Err(e @ QueueError::Rejected { .. }) => {
                        tracing::debug!(tube, job_id = job.id, error = %e, "Stale job already gone");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if removed > 0 {
            tracing::info!(tube, removed, "Cleared stale jobs");
        }
        Ok(removed)
    }

    /// Clear both tubes and publish one job per tile, pipelined, with the
    /// tile's index as its priority. Returns the number of jobs accepted.
    pub async fn publish(&self) -> Result<usize, SchedulerError> {
        self.clear_tube(&self.config.work_tube).await?;
        self.clear_tube(&self.config.result_tube).await?;

        self.client.watch(&self.config.result_tube).await?;
        self.client.ignore(DEFAULT_TUBE).await?;
        self.client.use_tube(&self.config.work_tube).await?;

        let tiles = decompose_frame(
            self.config.width,
            self.config.height,
            self.config.tile_size,
            self.config.levels,
        )?;

        let mut puts = Vec::with_capacity(tiles.len());
        for (index, tile) in tiles.into_iter().enumerate() {
            let priority = index as u32;
            let payload = JobPayload {
                scene_version: self.config.scene_version.clone(),
                tile,
                seed: self.config.seed.clone(),
                priority,
            };
            puts.push(
                self.client
                    .put(payload.to_bytes()?, priority, 0, self.config.job_ttr),
            );
        }

        let total = puts.len();
        let mut published = 0;
        for result in join_all(puts).await {
            match result {
                Ok(_) => published += 1,
                Err(e) => tracing::warn!(error = %e, "Publishing job failed"),
            }
        }

        tracing::info!(published, total, tube = %self.config.work_tube, "Published jobs");
        Ok(published)
    }

    /// Lease and absorb results until the tube is empty or a call fails.
    pub async fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            match self.client.reserve_with_timeout(0).await {
                Ok(Some(job)) => self.absorb(job, &mut report).await,
                Ok(None) | Err(QueueError::Disconnected) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Reserving result failed");
                    break;
                }
            }
        }
        report
    }

    async fn absorb(&mut self, job: Job, report: &mut DrainReport) {
        match job.json::<ResultPayload>() {
            Ok(result) if result.scene_version != self.config.scene_version => {
                tracing::debug!(
                    job_id = job.id,
                    version = %result.scene_version,
                    "Discarding result from another scene version",
                );
                report.discarded += 1;
            }
            Ok(result) => {
                let applied = decode_pixels(&result.tile, &result.data)
                    .and_then(|pixels| self.output.apply(&result.tile, &pixels));
                match applied {
                    Ok(ApplyOutcome::Applied) => {
                        tracing::debug!(
                            job_id = job.id,
                            x = result.tile.x,
                            y = result.tile.y,
                            sampling = result.tile.sampling,
                            "Applied result",
                        );
                        report.applied += 1;
                    }
                    Ok(ApplyOutcome::Superseded { .. }) => report.superseded += 1,
                    Err(e) => {
                        tracing::warn!(job_id = job.id, error = %e, "Dropping unusable result");
                        report.failed += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Dropping undecodable result");
                report.failed += 1;
            }
        }

        if let Err(e) = self.client.delete(job.id).await {
            tracing::warn!(job_id = job.id, error = %e, "Acknowledging result failed");
        }
    }

    fn save(&self) {
        let Some(path) = &self.output_path else {
            return;
        };
        if let Err(e) = write_png(path, &self.output) {
            tracing::warn!(error = %e, "Saving framebuffer failed");
        }
    }

    /// Publish the frame, then drain results on every tick until `cancel`
    /// fires.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<OutputAccumulator, SchedulerError> {
        self.publish().await?;

        let period = self.config.tick_interval.max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.client.ensure_connected().await {
                tracing::debug!(error = %e, "Broker still unreachable");
                continue;
            }

            let report = self.drain().await;
            if report.total() > 0 {
                tracing::info!(
                    applied = report.applied,
                    superseded = report.superseded,
                    discarded = report.discarded,
                    failed = report.failed,
                    tiles = self.output.tiles_written(),
                    "Drained results",
                );
            }
            if report.applied > 0 {
                self.save();
            }
        }

        tracing::info!("Server stopped");
        Ok(self.output)
    }
}
