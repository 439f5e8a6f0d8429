//! Polling helpers for async tests.
//!
//! Waiting on a condition with a deadline instead of a fixed sleep keeps the
//! supervisor and daemon tests from flaking on slow machines.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

/// Assert that an async condition eventually becomes true within a timeout.
///
/// Retries `f` every `interval` until it returns `Ok` or `timeout` passes,
/// then panics with the last error.
///
/// # Arguments
///
/// * `desc` - Human-readable description of what we're waiting for (for error messages)
/// * `timeout` - Maximum time to wait before failing
/// * `interval` - Time between retry attempts
/// * `f` - Async function that returns `Result<T, E>` where `Ok(_)` means success
///
/// # Example
///
/// ```rust,ignore
/// use clicker_lib::test_utils::assert_eventually;
///
/// // Wait up to 3 seconds for the supervisor to settle, checking every 100ms
/// assert_eventually(
///     "listener to become active",
///     Duration::from_secs(3),
///     Duration::from_millis(100),
///     || async {
///         match handle.status().await {
///             Ok(status) if status.state == SessionState::Active => Ok(()),
///             Ok(status) => Err(format!("still {}", status.state)),
///             Err(e) => Err(e.to_string()),
///         }
///     },
/// )
/// .await;
/// ```
pub async fn assert_eventually<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let last_error = match f().await {
            Ok(value) => return value,
            Err(e) => e.to_string(),
        };

        if Instant::now() >= deadline {
            panic!(
                "Timeout waiting for {} after {:?} ({} attempts)\nLast error: {}",
                desc, timeout, attempts, last_error
            );
        }
        tokio::time::sleep(interval).await;
    }
}

/// Variant of `assert_eventually` that takes a simple boolean condition.
///
/// Use when the condition has nothing useful to say on failure.
///
/// # Example
///
/// ```rust,ignore
/// use clicker_lib::test_utils::assert_eventually_bool;
///
/// assert_eventually_bool(
///     "cue to play",
///     Duration::from_secs(2),
///     Duration::from_millis(50),
///     || async { plays.load(Ordering::SeqCst) == 1 },
/// )
/// .await;
/// ```
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let condition = || {
        let fut = f();
        async move {
            if fut.await {
                Ok(())
            } else {
                Err("condition never became true")
            }
        }
    };
    assert_eventually(desc, timeout, interval, condition).await
}
