use std::future::Future;
use std::time::{Duration, Instant};

pub const DEFAULT_BASE_BACKOFF_SECONDS: f64 = 0.1;
pub const DEFAULT_MAX_BACKOFF_SECONDS: f64 = 3.0;

pub async fn exponential_backoff(n: u32, base_increment: f64, max_seconds: f64) {
    let backoff_duration_seconds =
        exponential_backoff_duration_seconds(n, base_increment, max_seconds);
    if backoff_duration_seconds > 0.0 {
        tracing::debug!(
            "Backoff: waiting {backoff_duration_seconds} seconds before processing with the task",
        );
        tokio::time::sleep(Duration::from_secs_f64(backoff_duration_seconds)).await;
    }
}

pub fn exponential_backoff_duration_seconds(n: u32, base_increment: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (1.0 + base_increment).powf(f64::from(n)).min(max_seconds)
    }
}

/// Backoff for attempt `n`, never sleeping past `deadline`.
fn capped_backoff(n: u32, deadline: Instant) -> Duration {
    let backoff = Duration::from_secs_f64(exponential_backoff_duration_seconds(
        n,
        DEFAULT_BASE_BACKOFF_SECONDS,
        DEFAULT_MAX_BACKOFF_SECONDS,
    ));
    backoff.min(deadline.saturating_duration_since(Instant::now()))
}

/// Polls `op` until it yields `Some`, or until `timeout` has elapsed.
///
/// `op` is always called at least once, and once more after the deadline,
/// so a zero timeout means "check exactly once". Returns `Ok(None)` on
/// timeout; errors from `op` are returned immediately.
pub async fn poll_until<T, E, O, F>(timeout: Duration, mut op: O) -> Result<Option<T>, E>
where
    O: FnMut() -> F,
    F: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0;
    loop {
        if let Some(v) = op().await? {
            return Ok(Some(v));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        attempts += 1;
        tokio::time::sleep(capped_backoff(attempts, deadline)).await;
    }
}

/// Blocking version of [`poll_until`], for code that runs outside of the
/// tokio runtime (catalog locks).
pub fn poll_until_blocking<T, E, O>(timeout: Duration, mut op: O) -> Result<Option<T>, E>
where
    O: FnMut() -> Result<Option<T>, E>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0;
    loop {
        if let Some(v) = op()? {
            return Ok(Some(v));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        attempts += 1;
        std::thread::sleep(capped_backoff(attempts, deadline));
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn backoff_defaults_produce_growing_backoff_sequence() {
        let mut current_backoff_value = None;

        for i in 0..10_000 {
            let new_backoff_value = exponential_backoff_duration_seconds(
                i,
                DEFAULT_BASE_BACKOFF_SECONDS,
                DEFAULT_MAX_BACKOFF_SECONDS,
            );

            if let Some(old_backoff_value) = current_backoff_value.replace(new_backoff_value) {
                assert!(
                    old_backoff_value <= new_backoff_value,
                    "{i}th backoff value {new_backoff_value} is smaller than the previous one {old_backoff_value}"
                )
            }
        }

        assert_eq!(
            current_backoff_value.expect("Should have produced backoff values to compare"),
            DEFAULT_MAX_BACKOFF_SECONDS,
        );
    }

    #[tokio::test]
    async fn poll_until_zero_timeout_checks_once() {
        let calls = AtomicU32::new(0);
        let res: Result<Option<()>, io::Error> = poll_until(Duration::ZERO, || async {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        })
        .await;
        assert!(res.unwrap().is_none());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn poll_until_returns_first_value() {
        let calls = AtomicU32::new(0);
        let res: Result<Option<u32>, io::Error> = poll_until(Duration::from_secs(10), || async {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            Ok((n >= 2).then_some(n))
        })
        .await;
        assert_eq!(res.unwrap(), Some(2));
    }

    #[test]
    fn poll_until_blocking_propagates_errors() {
        let res: Result<Option<()>, io::Error> =
            poll_until_blocking(Duration::from_secs(10), || {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            });
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::PermissionDenied);
    }
}
