use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tessera_core::hashing::scene_version;
use tessera_core::types::SamplingLevels;
use tessera_scheduler::SchedulerConfig;

/// Which topology this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Local workers only, no broker.
    Single,
    /// Publish jobs and aggregate results.
    Server,
    /// Lease jobs and render them.
    Client,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            other => Err(ConfigError::Invalid {
                name: "TESSERA_MODE",
                value: other.to_string(),
                reason: "expected single, server or client".to_string(),
            }),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "single",
            Self::Server => "server",
            Self::Client => "client",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {name}={value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub mode: Mode,
    /// Broker `host:port` (default: `127.0.0.1:11300`).
    pub broker_addr: String,
    /// Where the framebuffer is written as PNG (default: `render.png`).
    pub output_path: PathBuf,
    pub scheduler: SchedulerConfig,
}

impl RenderConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var            | Default                        |
    /// |--------------------|--------------------------------|
    /// | `TESSERA_MODE`     | `single`                       |
    /// | `BROKER_ADDR`      | `127.0.0.1:11300`              |
    /// | `FRAME_WIDTH`      | `1012`                         |
    /// | `FRAME_HEIGHT`     | `506`                          |
    /// | `TILE_SIZE`        | `16`                           |
    /// | `PREVIEW_SAMPLES`  | `1`                            |
    /// | `FINAL_SAMPLES`    | `64`                           |
    /// | `WORKER_COUNT`     | available parallelism          |
    /// | `SEED`             | `world`                        |
    /// | `WORK_TUBE`        | `jobs`                         |
    /// | `RESULT_TUBE`      | `result`                       |
    /// | `JOB_TTR_SECS`     | `60`                           |
    /// | `TICK_INTERVAL_MS` | `1000`                         |
    /// | `OUTPUT_PATH`      | `render.png`                   |
    /// | `SCENE_VERSION`    | hash of `kernel_identity`      |
    pub fn from_env(kernel_identity: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), kernel_identity)
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable
    /// source.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        kernel_identity: &str,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let defaults = SchedulerConfig::default();

        let mode: Mode = var("TESSERA_MODE", "single").parse()?;
        let broker_addr = var("BROKER_ADDR", "127.0.0.1:11300");
        let output_path = PathBuf::from(var("OUTPUT_PATH", "render.png"));

        let worker_count = match lookup("WORKER_COUNT") {
            Some(value) => positive("WORKER_COUNT", &value)?,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        let levels = SamplingLevels {
            preview: positive("PREVIEW_SAMPLES", &var("PREVIEW_SAMPLES", "1"))?,
            full: positive("FINAL_SAMPLES", &var("FINAL_SAMPLES", "64"))?,
        };
        if levels.preview > levels.full {
            return Err(ConfigError::Invalid {
                name: "PREVIEW_SAMPLES",
                value: levels.preview.to_string(),
                reason: format!("must not exceed FINAL_SAMPLES ({})", levels.full),
            });
        }

        let tick_ms: u64 = positive("TICK_INTERVAL_MS", &var("TICK_INTERVAL_MS", "1000"))?;

        let scheduler = SchedulerConfig {
            width: positive("FRAME_WIDTH", &var("FRAME_WIDTH", "1012"))?,
            height: positive("FRAME_HEIGHT", &var("FRAME_HEIGHT", "506"))?,
            tile_size: positive("TILE_SIZE", &var("TILE_SIZE", "16"))?,
            levels,
            seed: var("SEED", &defaults.seed),
            worker_count,
            tick_interval: Duration::from_millis(tick_ms),
            work_tube: var("WORK_TUBE", &defaults.work_tube),
            result_tube: var("RESULT_TUBE", &defaults.result_tube),
            job_ttr: positive("JOB_TTR_SECS", &var("JOB_TTR_SECS", "60"))?,
            scene_version: lookup("SCENE_VERSION")
                .unwrap_or_else(|| scene_version(kernel_identity)),
        };

        Ok(Self {
            mode,
            broker_addr,
            output_path,
            scheduler,
        })
    }

    /// Let a command-line argument override the configured mode.
    pub fn with_mode_arg(mut self, arg: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(arg) = arg {
            self.mode = arg.parse()?;
        }
        Ok(self)
    }
}

/// Parse a strictly positive number.
fn positive<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match value.trim().parse::<T>() {
        Ok(n) if n > T::default() => Ok(n),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "expected a positive integer".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<RenderConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RenderConfig::from_lookup(|name| map.get(name).cloned(), "sky-kernel/1")
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.mode, Mode::Single);
        assert_eq!(config.broker_addr, "127.0.0.1:11300");
        assert_eq!(config.output_path, PathBuf::from("render.png"));
        assert_eq!(config.scheduler.width, 1012);
        assert_eq!(config.scheduler.height, 506);
        assert_eq!(config.scheduler.tile_size, 16);
        assert_eq!(config.scheduler.levels, SamplingLevels { preview: 1, full: 64 });
        assert_eq!(config.scheduler.work_tube, "jobs");
        assert_eq!(config.scheduler.result_tube, "result");
        assert_eq!(config.scheduler.job_ttr, 60);
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(1));
        assert_eq!(config.scheduler.scene_version, scene_version("sky-kernel/1"));
        assert!(config.scheduler.worker_count >= 1);
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("TESSERA_MODE", "client"),
            ("FRAME_WIDTH", "40"),
            ("WORKER_COUNT", "3"),
            ("SCENE_VERSION", "pinned"),
            ("TICK_INTERVAL_MS", "250"),
        ])
        .unwrap();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.scheduler.width, 40);
        assert_eq!(config.scheduler.worker_count, 3);
        assert_eq!(config.scheduler.scene_version, "pinned");
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert_matches!(
            load(&[("TILE_SIZE", "0")]),
            Err(ConfigError::Invalid { name: "TILE_SIZE", .. })
        );
        assert_matches!(
            load(&[("FRAME_HEIGHT", "tall")]),
            Err(ConfigError::Invalid { name: "FRAME_HEIGHT", .. })
        );
        assert_matches!(
            load(&[("TESSERA_MODE", "peer")]),
            Err(ConfigError::Invalid { name: "TESSERA_MODE", .. })
        );
        assert_matches!(
            load(&[("PREVIEW_SAMPLES", "8"), ("FINAL_SAMPLES", "4")]),
            Err(ConfigError::Invalid { name: "PREVIEW_SAMPLES", .. })
        );
    }

    #[test]
    fn mode_argument_wins() {
        let config = load(&[("TESSERA_MODE", "client")])
            .unwrap()
            .with_mode_arg(Some("server"))
            .unwrap();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.mode.to_string(), "server");
    }
}
