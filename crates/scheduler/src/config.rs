//! Settings shared by every dispatcher.

use std::time::Duration;

use tessera_core::types::{FrameInfo, SamplingLevels};

/// Frame, pool and queue parameters of one render run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub levels: SamplingLevels,
    /// Default RNG seed; networked jobs carry their own.
    pub seed: String,
    pub worker_count: usize,
    /// Period of the dispatch tick (and of the server's result drain).
    pub tick_interval: Duration,
    pub work_tube: String,
    pub result_tube: String,
    /// Lease time granted to each published job, in seconds.
    pub job_ttr: u32,
    /// Tag that must match between producer and consumer of a job.
    pub scene_version: String,
}

impl SchedulerConfig {
    pub fn frame(&self) -> FrameInfo {
        FrameInfo {
            width: self.width,
            height: self.height,
            seed: self.seed.clone(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            width: 1012,
            height: 506,
            tile_size: 16,
            levels: SamplingLevels::default(),
            seed: "world".to_string(),
            worker_count: 1,
            tick_interval: Duration::from_secs(1),
            work_tube: "jobs".to_string(),
            result_tube: "result".to_string(),
            job_ttr: 60,
            scene_version: String::new(),
        }
    }
}
