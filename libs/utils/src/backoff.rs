use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_BACKOFF_SECONDS: f64 = 0.1;
pub const DEFAULT_MAX_BACKOFF_SECONDS: f64 = 3.0;

pub async fn exponential_backoff(
    n: u32,
    base_increment: f64,
    max_seconds: f64,
    cancel: &CancellationToken,
) {
    let backoff_duration_seconds =
        exponential_backoff_duration_seconds(n, base_increment, max_seconds);
    if backoff_duration_seconds > 0.0 {
        tracing::info!("Backoff: waiting {backoff_duration_seconds} seconds before processing with the task",);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(backoff_duration_seconds)) => {}
            _ = cancel.cancelled() => {}
        };
    }
}

pub fn exponential_backoff_duration_seconds(n: u32, base_increment: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (1.0 + base_increment).powf(f64::from(n)).min(max_seconds)
    }
}

/// Retry a failure-prone async operation with exponential backoff, until it
/// succeeds, `is_permanent` classifies the error as not worth retrying,
/// `max_retries` attempts were made, or the token fires.
///
/// `None` is returned only on cancellation.
pub async fn retry<T, O, F, E>(
    mut op: O,
    is_permanent: impl Fn(&E) -> bool,
    warn_threshold: u32,
    max_retries: u32,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    // not generic over E's bound to avoid pushing Display on all callers
    E: Display + 'static,
    O: FnMut() -> F,
    F: Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let result = op().await;
        match &result {
            Ok(_) => {
                if attempts > 0 {
                    tracing::info!("{description} succeeded after {attempts} retries");
                }
                return Some(result);
            }
            Err(err) if is_permanent(err) => {
                return Some(result);
            }
            Err(err) => {
                if attempts < warn_threshold {
                    tracing::info!("{description} failed, will retry (attempt {attempts}): {err}");
                } else {
                    tracing::warn!("{description} failed, will retry (attempt {attempts}): {err}");
                }
            }
        }

        if attempts >= max_retries {
            return Some(result);
        }

        exponential_backoff(
            attempts,
            DEFAULT_BASE_BACKOFF_SECONDS,
            DEFAULT_MAX_BACKOFF_SECONDS,
            cancel,
        )
        .await;
        attempts += 1;
    }
}
