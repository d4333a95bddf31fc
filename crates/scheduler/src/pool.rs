//! Worker-pool coordinator.
//!
//! [`WorkerPoolCoordinator`] keeps a registry of worker handles and drives
//! them with a dispatch tick. Every tick keeps busy workers' leases alive
//! and hands work to the idle ones. A tick runs at start-up, after every
//! completion and on a fixed timer.
//!
//! Worker state only moves `loading -> free -> busy -> free`. The
//! `loading -> free` step happens right after the one-time `Init` message,
//! which is sent immediately before a worker's first job.
//!
//! A tile whose kernel call panicked frees its worker and is handed back
//! to the source through [`WorkSource::abandon`]. A worker task that exits
//! unexpectedly is respawned in the `loading` state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::kernel::RenderKernel;
use tessera_core::types::{FrameInfo, JobId, Tile, WorkerId};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::source::{Acquisition, WorkSource};
use crate::worker::{Completion, WorkerEvent, WorkerMessage, WorkerUnit};

/// Lifecycle state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet initialised.
    Loading,
    Free,
    Busy,
}

/// Registry entry for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub state: WorkerState,
    pub current_job: Option<JobId>,
}

impl WorkerHandle {
    fn new() -> Self {
        Self {
            state: WorkerState::Loading,
            current_job: None,
        }
    }

    /// Move to `next` if the lifecycle allows it.
    fn transition(&mut self, next: WorkerState) -> bool {
        use WorkerState::*;
        let allowed = matches!(
            (self.state, next),
            (Loading, Free) | (Free, Busy) | (Busy, Free)
        );
        if allowed {
            self.state = next;
        }
        allowed
    }

    fn is_idle(&self) -> bool {
        self.state != WorkerState::Busy
    }
}

/// How a pool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOutcome {
    /// The source ran dry and every worker went idle.
    Finished { elapsed: Duration },
    /// A job from another scene version was seen.
    Reload,
    Cancelled,
}

/// Pool sizing and frame parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub frame: FrameInfo,
    pub tick_interval: Duration,
}

pub struct WorkerPoolCoordinator<S> {
    source: S,
    config: PoolConfig,
    kernel: Arc<dyn RenderKernel>,
    registry: BTreeMap<WorkerId, WorkerHandle>,
    units: BTreeMap<WorkerId, WorkerUnit>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl<S: WorkSource> WorkerPoolCoordinator<S> {
    pub fn new(source: S, config: PoolConfig, kernel: Arc<dyn RenderKernel>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            source,
            config,
            kernel,
            registry: BTreeMap::new(),
            units: BTreeMap::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Snapshot of the registry entry for `worker_id`.
    pub fn worker(&self, worker_id: WorkerId) -> Option<&WorkerHandle> {
        self.registry.get(&worker_id)
    }

    /// Spawn the workers and dispatch until the source is exhausted, a
    /// reload is requested or `cancel` fires. Workers are torn down on
    /// every exit path.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<PoolOutcome, SchedulerError> {
        let started = Instant::now();
        self.spawn_workers();
        tracing::info!(
            worker_count = self.config.worker_count,
            width = self.config.frame.width,
            height = self.config.frame.height,
            "Worker pool started",
        );

        let outcome = self.drive(cancel, started).await;
        self.teardown().await;

        if let Ok(outcome) = &outcome {
            tracing::info!(?outcome, "Worker pool stopped");
        }
        outcome
    }

    fn spawn_workers(&mut self) {
        for worker_id in 0..self.config.worker_count.max(1) {
            self.spawn_worker(worker_id);
        }
    }

    fn spawn_worker(&mut self, worker_id: WorkerId) {
        let unit = WorkerUnit::spawn(worker_id, Arc::clone(&self.kernel), self.events_tx.clone());
        self.units.insert(worker_id, unit);
        self.registry.insert(worker_id, WorkerHandle::new());
    }

    async fn drive(
        &mut self,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<PoolOutcome, SchedulerError> {
        if let Some(outcome) = self.tick(started).await? {
            return Ok(outcome);
        }

        let period = self.config.tick_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; the start-up tick
        // above already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(PoolOutcome::Cancelled),
                Some(event) = self.events_rx.recv() => {
                    self.on_event(event).await;
                }
                _ = ticker.tick() => {}
            }

            if let Some(outcome) = self.tick(started).await? {
                return Ok(outcome);
            }
        }
    }

    /// One dispatch pass over the registry.
    async fn tick(&mut self, started: Instant) -> Result<Option<PoolOutcome>, SchedulerError> {
        self.source.on_tick().await;
        self.reap_dead_workers().await;

        let ids: Vec<WorkerId> = self.registry.keys().copied().collect();
        let mut source_empty = false;
        for worker_id in ids {
            let Some(handle) = self.registry.get(&worker_id) else {
                continue;
            };

            if handle.state == WorkerState::Busy {
                if let Some(job_id) = handle.current_job {
                    self.source.keep_alive(job_id).await;
                }
                continue;
            }
            if source_empty {
                continue;
            }

            match self.source.acquire().await {
                Acquisition::Work { job_id, tile, seed } => {
                    self.dispatch(worker_id, job_id, tile, seed)?;
                }
                Acquisition::Empty => source_empty = true,
                Acquisition::Reload => return Ok(Some(PoolOutcome::Reload)),
            }
        }

        let all_idle = self.registry.values().all(WorkerHandle::is_idle);
        if all_idle && self.source.is_exhausted() {
            let elapsed = started.elapsed();
            return Ok(Some(PoolOutcome::Finished { elapsed }));
        }
        Ok(None)
    }

    fn dispatch(
        &mut self,
        worker_id: WorkerId,
        job_id: JobId,
        tile: Tile,
        seed: Option<String>,
    ) -> Result<(), SchedulerError> {
        let worker_count = self.config.worker_count.max(1);
        let frame = &self.config.frame;
        let unit = self
            .units
            .get(&worker_id)
            .ok_or(SchedulerError::WorkerGone(worker_id))?;
        let handle = self
            .registry
            .get_mut(&worker_id)
            .ok_or(SchedulerError::WorkerGone(worker_id))?;

        if handle.state == WorkerState::Loading {
            let init = WorkerMessage::Init {
                worker_id,
                worker_count,
                width: frame.width,
                height: frame.height,
                seed: seed.unwrap_or_else(|| frame.seed.clone()),
            };
            if !unit.send(init) {
                return Err(SchedulerError::WorkerGone(worker_id));
            }
            handle.transition(WorkerState::Free);
        }

        if !unit.send(WorkerMessage::Work { job_id, tile }) {
            return Err(SchedulerError::WorkerGone(worker_id));
        }
        handle.transition(WorkerState::Busy);
        handle.current_job = Some(job_id);

        tracing::debug!(
            worker_id,
            job_id,
            x = tile.x,
            y = tile.y,
            sampling = tile.sampling,
            "Dispatched tile",
        );
        Ok(())
    }

    async fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Completed(completion) => self.on_completion(completion).await,
            WorkerEvent::Failed {
                worker_id,
                job_id,
                reason,
            } => {
                if self.release_slot(worker_id, job_id) {
                    tracing::warn!(worker_id, job_id, reason = %reason, "Abandoning tile after kernel failure");
                    self.source.abandon(job_id).await;
                }
            }
        }
    }

    /// Free `worker_id` if it is busy with `job_id`.
    fn release_slot(&mut self, worker_id: WorkerId, job_id: JobId) -> bool {
        let Some(handle) = self.registry.get_mut(&worker_id) else {
            return false;
        };
        if handle.current_job != Some(job_id) || !handle.transition(WorkerState::Free) {
            tracing::warn!(worker_id, job_id, state = ?handle.state, "Unexpected worker event");
            return false;
        }
        handle.current_job = None;
        true
    }

    /// Replace worker tasks that exited on their own, abandoning whatever
    /// job they held.
    async fn reap_dead_workers(&mut self) {
        let dead: Vec<WorkerId> = self
            .units
            .iter()
            .filter(|(_, unit)| unit.is_finished())
            .map(|(worker_id, _)| *worker_id)
            .collect();

        for worker_id in dead {
            let lost_job = self
                .registry
                .get(&worker_id)
                .and_then(|handle| handle.current_job);
            tracing::warn!(worker_id, ?lost_job, "Worker task exited, respawning");
            if let Some(unit) = self.units.remove(&worker_id) {
                if let Err(e) = unit.task.await {
                    tracing::warn!(worker_id, error = %e, "Worker task ended abnormally");
                }
            }
            self.spawn_worker(worker_id);
            if let Some(job_id) = lost_job {
                self.source.abandon(job_id).await;
            }
        }
    }

    async fn on_completion(&mut self, completion: Completion) {
        if !self.release_slot(completion.worker_id, completion.job_id) {
            return;
        }
        tracing::debug!(
            worker_id = completion.worker_id,
            job_id = completion.job_id,
            "Tile completed",
        );
        self.source.complete(completion).await;
    }

    async fn teardown(&mut self) {
        for (worker_id, unit) in std::mem::take(&mut self.units) {
            drop(unit.tx);
            unit.task.abort();
            if let Err(e) = unit.task.await {
                if !e.is_cancelled() {
                    tracing::warn!(worker_id, error = %e, "Worker task ended abnormally");
                }
            }
        }
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut handle = WorkerHandle::new();
        assert!(!handle.transition(WorkerState::Busy));
        assert!(handle.transition(WorkerState::Free));
        assert!(!handle.transition(WorkerState::Loading));
        assert!(handle.transition(WorkerState::Busy));
        assert!(!handle.transition(WorkerState::Busy));
        assert!(handle.transition(WorkerState::Free));
        assert_eq!(handle.state, WorkerState::Free);
    }

    #[test]
    fn loading_counts_as_idle() {
        let mut handle = WorkerHandle::new();
        assert!(handle.is_idle());
        handle.transition(WorkerState::Free);
        handle.transition(WorkerState::Busy);
        assert!(!handle.is_idle());
    }
}
