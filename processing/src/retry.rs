//! Fixed back-off retry and shutdown-aware sleeping.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

/// Sleep granularity while waiting; bounds the shutdown latency.
const SLICE: Duration = Duration::from_millis(250);

/// Sleep for `total` unless `shutdown` is raised first.  Returns `false`
/// when the sleep was cut short.
pub fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}

/// Run `op` up to `attempts` times, waiting `wait` between attempts.
///
/// Only errors for which `is_retryable` returns `true` are retried; any
/// other error, the last error, or a shutdown during the wait is returned
/// as is.  `op` receives the 1-based attempt number.
pub fn retry_fixed<T, E, F, R>(
    attempts: u32,
    wait: Duration,
    shutdown: &AtomicBool,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && is_retryable(&e) => {
                warn!("Attempt {attempt}/{attempts} failed: {e}; retrying in {}s", wait.as_secs_f64());
                if !sleep_unless_shutdown(wait, shutdown) {
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
