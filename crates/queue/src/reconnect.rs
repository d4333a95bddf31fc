//! Fixed-interval reconnection for broker sessions.
//!
//! Dispatchers call [`QueueClient::ensure_connected`] once per tick, which
//! already gives a fixed retry cadence while the broker is down. At
//! start-up a process instead blocks in [`connect_with_retry`] until the
//! first session is up or the [`CancellationToken`] fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::QueueClient;

/// Tunable parameters for the retry loop.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay between attempts. Constant; there is no backoff.
    pub interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Keep trying to open a session for `client`.
///
/// Returns `true` once connected, or `false` if `cancel` is triggered
/// first.
pub async fn connect_with_retry(
    client: &QueueClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> bool {
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(addr = client.addr(), "Broker connect cancelled");
                return false;
            }
            result = client.ensure_connected() => {
                match result {
                    Ok(()) => {
                        if attempt > 1 {
                            tracing::info!(addr = client.addr(), attempt, "Connected to broker after retrying");
                        }
                        return true;
                    }
                    Err(e) => {
                        tracing::warn!(
                            addr = client.addr(),
                            error = %e,
                            "Broker connect attempt {attempt} failed",
                        );
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_token_stops_retry() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = QueueClient::new("127.0.0.1:1");
        let connected = connect_with_retry(&client, &ReconnectConfig::default(), &cancel).await;
        assert!(!connected);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn retries_until_cancelled() {
        let cancel = CancellationToken::new();
        let client = QueueClient::new("127.0.0.1:1");
        let config = ReconnectConfig {
            interval: std::time::Duration::from_millis(10),
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        assert!(!connect_with_retry(&client, &config, &cancel).await);
    }
}
