//! Client topology: lease tiles from the broker, render them locally and
//! publish encoded results.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::encoding::encode_pixels;
use tessera_core::kernel::RenderKernel;
use tessera_core::payload::{JobPayload, ResultPayload};
use tessera_core::types::JobId;
use tessera_queue::{QueueClient, QueueError, DEFAULT_TUBE};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::pool::{PoolConfig, PoolOutcome, WorkerPoolCoordinator};
use crate::source::{Acquisition, WorkSource};
use crate::worker::Completion;

/// Priority given to published results; the server drains them all anyway.
const RESULT_PRIORITY: u32 = 0;

/// Priority for jobs set aside because their payload cannot be read.
const BURY_PRIORITY: u32 = 0;

/// Leases jobs from the work tube and answers on the result tube.
pub struct NetworkSource {
    client: Arc<QueueClient>,
    scene_version: String,
    result_ttr: u32,
    leases: HashMap<JobId, JobPayload>,
}

impl NetworkSource {
    pub fn new(client: Arc<QueueClient>, scene_version: String, result_ttr: u32) -> Self {
        Self {
            client,
            scene_version,
            result_ttr,
            leases: HashMap::new(),
        }
    }

    /// Jobs currently leased by this process.
    pub fn leased(&self) -> usize {
        self.leases.len()
    }

    fn publish_bytes(&self, completion: &Completion) -> Result<Vec<u8>, SchedulerError> {
        let data = encode_pixels(&completion.tile, &completion.pixels)?;
        let payload = ResultPayload {
            scene_version: self.scene_version.clone(),
            tile: completion.tile,
            data,
        };
        Ok(payload.to_bytes()?)
    }
}

#[async_trait]
impl WorkSource for NetworkSource {
    async fn on_tick(&mut self) {
        if let Err(e) = self.client.ensure_connected().await {
            tracing::debug!(error = %e, "Broker still unreachable");
        }
    }

    async fn acquire(&mut self) -> Acquisition {
        let job = match self.client.reserve_with_timeout(0).await {
            Ok(Some(job)) => job,
            Ok(None) | Err(QueueError::Disconnected) => return Acquisition::Empty,
            Err(e) => {
                tracing::warn!(error = %e, "Reserve failed");
                return Acquisition::Empty;
            }
        };

        let payload = match job.json::<JobPayload>() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Undecodable job, burying");
                if let Err(e) = self.client.bury(job.id, BURY_PRIORITY).await {
                    tracing::warn!(job_id = job.id, error = %e, "Bury failed");
                }
                return Acquisition::Empty;
            }
        };

        if payload.scene_version != self.scene_version {
            tracing::warn!(
                job_id = job.id,
                job_version = %payload.scene_version,
                our_version = %self.scene_version,
                "Scene version mismatch, releasing job and reloading",
            );
            if let Err(e) = self.client.release(job.id, payload.priority, 0).await {
                tracing::warn!(job_id = job.id, error = %e, "Release failed");
            }
            return Acquisition::Reload;
        }

        tracing::info!(job_id = job.id, "Leased job");
        let acquisition = Acquisition::Work {
            job_id: job.id,
            tile: payload.tile,
            seed: Some(payload.seed.clone()),
        };
        self.leases.insert(job.id, payload);
        acquisition
    }

    async fn keep_alive(&mut self, job_id: JobId) {
        if let Err(e) = self.client.touch(job_id).await {
            tracing::warn!(job_id, error = %e, "Touch failed");
        }
    }

    async fn complete(&mut self, completion: Completion) {
        let job_id = completion.job_id;
        self.leases.remove(&job_id);

        // Publish and acknowledge independently; neither rolls back the
        // other.
        let put = match self.publish_bytes(&completion) {
            Ok(bytes) => Some(self.client.put(bytes, RESULT_PRIORITY, 0, self.result_ttr)),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Could not encode result");
                None
            }
        };
        let delete = self.client.delete(job_id);

        if let Some(put) = put {
            match put.await {
                Ok(result_id) => tracing::debug!(job_id, result_id, "Published result"),
                Err(e) => tracing::warn!(job_id, error = %e, "Publishing result failed"),
            }
        }
        if let Err(e) = delete.await {
            tracing::warn!(job_id, error = %e, "Acknowledging job failed");
        }
    }

    async fn abandon(&mut self, job_id: JobId) {
        // Without touches the broker reclaims the lease once its ttr runs out.
        if self.leases.remove(&job_id).is_some() {
            tracing::warn!(job_id, "Abandoned lease, leaving it to expire");
        }
    }

    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Runs a worker pool fed from the broker's work tube.
pub struct ClientDispatcher {
    client: Arc<QueueClient>,
    config: SchedulerConfig,
    kernel: Arc<dyn RenderKernel>,
}

impl ClientDispatcher {
    pub fn new(
        client: Arc<QueueClient>,
        config: SchedulerConfig,
        kernel: Arc<dyn RenderKernel>,
    ) -> Self {
        Self {
            client,
            config,
            kernel,
        }
    }

    /// Lease from the work tube only and produce into the result tube.
    pub async fn subscribe(&self) {
        let watch = self.client.watch(&self.config.work_tube);
        let ignore = self.client.ignore(DEFAULT_TUBE);
        let used = self.client.use_tube(&self.config.result_tube);

        let (watch, ignore, used) = futures::join!(watch, ignore, used);
        for (command, result) in [
            ("watch", watch.map(|_| ())),
            ("ignore", ignore.map(|_| ())),
            ("use", used.map(|_| ())),
        ] {
            if let Err(e) = result {
                // Replayed on the next reconnect.
                tracing::warn!(command, error = %e, "Tube selection failed");
            }
        }
    }

    /// Work until a reload is needed or `cancel` fires. Never finishes on
    /// its own.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PoolOutcome, SchedulerError> {
        self.subscribe().await;

        let source = NetworkSource::new(
            Arc::clone(&self.client),
            self.config.scene_version.clone(),
            self.config.job_ttr,
        );
        let pool_config = PoolConfig {
            worker_count: self.config.worker_count,
            frame: self.config.frame(),
            tick_interval: self.config.tick_interval,
        };
        let mut pool = WorkerPoolCoordinator::new(source, pool_config, Arc::clone(&self.kernel));
        pool.run(cancel).await
    }
}
