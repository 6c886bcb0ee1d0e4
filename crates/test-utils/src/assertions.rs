//! Polling assertions for work that completes on another thread.

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Default polling interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a condition until it returns true or the timeout expires.
///
/// # Returns
///
/// `true` if the condition became true before timeout, `false` otherwise.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use genstore_test_utils::assert_eventually;
///
/// # async fn demo(path: std::path::PathBuf) {
/// let gone = assert_eventually(Duration::from_secs(5), || !path.exists()).await;
/// assert!(gone, "orphan file should be wiped");
/// # }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    condition()
}

/// Blocking variant of [`assert_eventually`] for tests that drive the disk
/// worker from plain threads.
pub fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(DEFAULT_POLL_INTERVAL);
    }

    condition()
}
