//! `tessera` binary.
//!
//! ```text
//! tessera [single|server|client]
//! ```
//!
//! The positional argument overrides `TESSERA_MODE`. All other settings
//! come from the environment (see [`RenderConfig::from_env`]); a `.env`
//! file in the working directory is loaded first.
//!
//! Exit code 75 means a job for a newer scene version was seen and the
//! process should be restarted by its supervisor.

use std::process::ExitCode;
use std::sync::Arc;

use tessera_core::kernel::{RenderKernel, SkyKernel};
use tessera_worker::{RenderConfig, RunOutcome};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RELOAD_EXIT_CODE: u8 = 75;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tessera=info,tessera_worker=info,tessera_scheduler=info,tessera_queue=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let kernel: Arc<dyn RenderKernel> = Arc::new(SkyKernel);
    let config = RenderConfig::from_env(&kernel.identity())?
        .with_mode_arg(std::env::args().nth(1).as_deref())?;

    tracing::info!(
        mode = %config.mode,
        broker = %config.broker_addr,
        workers = config.scheduler.worker_count,
        width = config.scheduler.width,
        height = config.scheduler.height,
        scene_version = %config.scheduler.scene_version,
        "Starting tessera",
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let outcome = tessera_worker::run(config, kernel, &cancel).await?;
    tracing::info!(?outcome, "Shut down");

    Ok(match outcome {
        RunOutcome::Reload => ExitCode::from(RELOAD_EXIT_CODE),
        RunOutcome::Completed | RunOutcome::Stopped => ExitCode::SUCCESS,
    })
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
    cancel.cancel();
}
