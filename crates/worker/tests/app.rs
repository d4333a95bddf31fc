//! Process-level tests: configuration flows into the chosen topology.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::kernel::{RenderKernel, SkyKernel};
use tessera_core::types::SamplingLevels;
use tessera_scheduler::SchedulerConfig;
use tessera_worker::{Mode, RenderConfig, RunOutcome};
use tokio_util::sync::CancellationToken;

fn small_config(mode: Mode, broker_addr: String, output_path: PathBuf) -> RenderConfig {
    RenderConfig {
        mode,
        broker_addr,
        output_path,
        scheduler: SchedulerConfig {
            width: 24,
            height: 12,
            tile_size: 8,
            levels: SamplingLevels {
                preview: 1,
                full: 2,
            },
            worker_count: 2,
            tick_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
    }
}

/// An address nothing listens on.
fn dead_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

// ---------------------------------------------------------------------------
// Test: single mode renders the frame and writes a PNG
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_mode_writes_png() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    let config = small_config(Mode::Single, dead_addr(), path.clone());
    let kernel: Arc<dyn RenderKernel> = Arc::new(SkyKernel);

    let outcome = tessera_worker::run(config, kernel, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
}

// ---------------------------------------------------------------------------
// Test: a client waiting for an absent broker stops on cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_without_broker_stops_on_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(Mode::Client, dead_addr(), dir.path().join("unused.png"));
    let kernel: Arc<dyn RenderKernel> = Arc::new(SkyKernel);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        tessera_worker::run(config, kernel, &cancel),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(outcome, RunOutcome::Stopped);
    assert!(!dir.path().join("unused.png").exists());
}
