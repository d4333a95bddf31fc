//! Topology selection: wires configuration, broker session and kernel
//! into the dispatcher for the configured mode.

use std::sync::Arc;

use anyhow::Context;
use tessera_core::encoding::write_png;
use tessera_core::kernel::RenderKernel;
use tessera_queue::reconnect::{connect_with_retry, ReconnectConfig};
use tessera_queue::QueueClient;
use tessera_scheduler::client::ClientDispatcher;
use tessera_scheduler::local::SingleProcessDispatcher;
use tessera_scheduler::server::ServerAggregator;
use tessera_scheduler::PoolOutcome;
use tokio_util::sync::CancellationToken;

use crate::config::{Mode, RenderConfig};

/// How the process should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The frame was rendered (single mode only).
    Completed,
    /// A job from a newer scene version was seen; restart with fresh code.
    Reload,
    /// Shutdown was requested.
    Stopped,
}

/// Run the configured topology until it finishes, needs a reload or
/// `cancel` fires.
pub async fn run(
    config: RenderConfig,
    kernel: Arc<dyn RenderKernel>,
    cancel: &CancellationToken,
) -> anyhow::Result<RunOutcome> {
    match config.mode {
        Mode::Single => run_single(config, kernel, cancel).await,
        Mode::Server => run_server(config, cancel).await,
        Mode::Client => run_client(config, kernel, cancel).await,
    }
}

async fn run_single(
    config: RenderConfig,
    kernel: Arc<dyn RenderKernel>,
    cancel: &CancellationToken,
) -> anyhow::Result<RunOutcome> {
    let dispatcher = SingleProcessDispatcher::new(config.scheduler.clone(), kernel);
    let render = dispatcher.run(cancel).await?;

    write_png(&config.output_path, &render.output)
        .with_context(|| format!("writing {}", config.output_path.display()))?;
    tracing::info!(path = %config.output_path.display(), "Wrote framebuffer");

    Ok(match render.outcome {
        PoolOutcome::Finished { .. } => RunOutcome::Completed,
        PoolOutcome::Reload => RunOutcome::Reload,
        PoolOutcome::Cancelled => RunOutcome::Stopped,
    })
}

/// Connect to the broker, retrying until connected or cancelled.
async fn broker_session(
    config: &RenderConfig,
    cancel: &CancellationToken,
) -> Option<Arc<QueueClient>> {
    let client = QueueClient::new(config.broker_addr.clone());
    let reconnect = ReconnectConfig {
        interval: config.scheduler.tick_interval,
    };
    if connect_with_retry(&client, &reconnect, cancel).await {
        Some(Arc::new(client))
    } else {
        None
    }
}

async fn run_server(config: RenderConfig, cancel: &CancellationToken) -> anyhow::Result<RunOutcome> {
    let Some(client) = broker_session(&config, cancel).await else {
        return Ok(RunOutcome::Stopped);
    };

    let server = ServerAggregator::new(client, config.scheduler.clone())
        .with_output_path(config.output_path.clone());
    let output = server.run(cancel).await?;

    write_png(&config.output_path, &output)
        .with_context(|| format!("writing {}", config.output_path.display()))?;
    Ok(RunOutcome::Stopped)
}

async fn run_client(
    config: RenderConfig,
    kernel: Arc<dyn RenderKernel>,
    cancel: &CancellationToken,
) -> anyhow::Result<RunOutcome> {
    let Some(client) = broker_session(&config, cancel).await else {
        return Ok(RunOutcome::Stopped);
    };

    let dispatcher = ClientDispatcher::new(client, config.scheduler.clone(), kernel);
    Ok(match dispatcher.run(cancel).await? {
        PoolOutcome::Reload => RunOutcome::Reload,
        PoolOutcome::Finished { .. } | PoolOutcome::Cancelled => RunOutcome::Stopped,
    })
}
