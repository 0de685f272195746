use std::{fmt::Display, future::Future};

use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::models::{error::ConnectionError, retry::RetryPolicy};

/// Bytes of an undecodable body included in logs.
pub const PREVIEW_LIMIT: usize = 100;

/// Drives `connect` until it succeeds or `policy` runs out of attempts,
/// sleeping `policy.delay_for(attempt)` between failures.
pub async fn connect_with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut connect: F,
) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match connect().await {
            Ok(connection) => {
                if attempt > 1 {
                    info!(attempt, "Broker connection succeeded after retrying");
                }
                return Ok(connection);
            }
            Err(e) => {
                if policy.is_exhausted(attempt) {
                    error!(
                        attempt,
                        error = %e,
                        "Broker connection failed, no attempts left"
                    );
                    return Err(ConnectionError::Exhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }

                let delay = policy.delay_for(attempt);

                warn!(
                    attempt,
                    max_attempts = ?policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Broker connection attempt failed, retrying"
                );

                sleep(delay).await;
            }
        }
    }
}

/// Lossy UTF-8 rendering of at most `limit` bytes of `body`.
pub fn body_preview(body: &[u8], limit: usize) -> String {
    if body.len() <= limit {
        return String::from_utf8_lossy(body).into_owned();
    }

    format!("{}...", String::from_utf8_lossy(&body[..limit]))
}

/// JSON log output filtered by `RUST_LOG`, `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Resolves on Ctrl-C. If the signal handler cannot be installed it never
/// resolves, so the process keeps running.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_bodies() {
        let body = vec![b'x'; 250];
        let preview = body_preview(&body, PREVIEW_LIMIT);

        assert_eq!(preview.len(), PREVIEW_LIMIT + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn preview_keeps_short_bodies_and_replaces_invalid_utf8() {
        assert_eq!(body_preview(b"not json", PREVIEW_LIMIT), "not json");
        assert_eq!(body_preview(&[0x61, 0xff], PREVIEW_LIMIT), "a\u{fffd}");
    }
}
