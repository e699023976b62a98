//! Bootstrap utilities for cachebus binaries.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the CACHEBUS_LOG environment variable.
///
/// Defaults to "info" level if CACHEBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to a backing service with exponential backoff retry.
///
/// `retryable` decides whether an error is worth another attempt; the first
/// non-retryable error, or the last error once attempts run out, is returned.
pub async fn connect_with_retry<T, E, F, Fut, R>(
    service_name: &str,
    connect: F,
    retryable: R,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut delays = connection_backoff().build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                info!(service = %service_name, attempt = attempt, "Connected");
                return Ok(client);
            }
            Err(e) if retryable(&e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        service = %service_name,
                        attempt = attempt,
                        error = %e,
                        retry_in_ms = %delay.as_millis(),
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(service = %service_name, attempts = attempt, error = %e, "Connection failed, giving up");
                    return Err(e);
                }
            },
            Err(e) => {
                error!(service = %service_name, error = %e, "Connection failed");
                return Err(e);
            }
        }
    }
}
