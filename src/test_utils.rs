//! Test utilities for async/daemon tests
//!
//! Helpers for writing reliable async tests with proper timeout/retry
//! semantics instead of arbitrary sleeps.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Assert that an async condition eventually becomes true within a timeout.
///
/// Retries the provided async function at the specified interval until
/// it succeeds or the timeout is reached.
///
/// # Example
///
/// ```rust,ignore
/// # use std::time::Duration;
/// # async fn example() {
/// use appdock::test_utils::assert_eventually;
///
/// // Wait up to 3 seconds for the process to exit, checking every 100ms
/// assert_eventually(
///     "process to exit",
///     Duration::from_secs(3),
///     Duration::from_millis(100),
///     || async {
///         match registry.lookup(app_id) {
///             None => Ok(()),
///             Some(_) => Err("still registered"),
///         }
///     }
/// ).await;
/// # }
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
    let start = std::time::Instant::now();
    let mut last_error = String::from("no attempts made");
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                last_error = e.to_string();

                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    panic!(
                        "Timeout waiting for {}\n\
                         Duration: {:?}\n\
                         Attempts: {}\n\
                         Last error: {}",
                        desc, elapsed, attempt, last_error
                    );
                }

                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Variant of `assert_eventually` that takes a simple boolean condition.
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if f().await {
            return;
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            panic!(
                "Timeout waiting for {}\n\
                 Duration: {:?}\n\
                 Attempts: {}\n\
                 Condition never became true",
                desc, elapsed, attempt
            );
        }

        tokio::time::sleep(interval).await;
    }
}
