//! Polling primitive — "wait until the predicate holds or time out".
//!
//! Every verification in the harness suspends through this single routine.
//! The loop is an explicit state machine (elapsed clock, current interval,
//! consecutive-error count): a throwing predicate is "not yet satisfied" and
//! widens the interval exponentially to shed load on a struggling backend;
//! any clean evaluation resets the interval to its base. The sleep before
//! the next iteration is shortened by the predicate's own execution time so
//! the polling cadence stays approximately constant regardless of predicate
//! cost. Each call owns its loop state; any number of waits may be in
//! flight concurrently.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Interval ceiling reached under repeated predicate errors.
const MAX_INTERVAL: Duration = Duration::from_millis(5000);

/// Timeout and base polling interval for one wait.
#[derive(Clone, Copy, Debug)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(100),
        }
    }
}

impl PollSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// The awaited condition never held within its wall-clock bound.
#[derive(Debug, Error)]
#[error(
    "condition \"{description}\" not satisfied within {timeout:?}{}",
    .last_error
        .as_deref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
)]
pub struct WaitTimeout {
    pub description: String,
    pub timeout: Duration,
    /// Text of the most recent predicate error, when one occurred.
    pub last_error: Option<String>,
}

/// Poll `predicate` until it returns `Ok(true)`, or fail after
/// `settings.timeout` with an error naming `description`.
///
/// A predicate `Err` is treated as "not yet", never as fatal.
pub async fn wait_until<F, Fut, E>(
    settings: PollSettings,
    description: impl Into<String>,
    mut predicate: F,
) -> Result<(), WaitTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
{
    let description = description.into();
    let started = Instant::now();
    let mut interval = settings.interval;
    let mut consecutive_errors = 0u32;
    let mut last_error: Option<String> = None;

    loop {
        let poll_started = Instant::now();
        match predicate().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                consecutive_errors = 0;
                interval = settings.interval;
            }
            Err(error) => {
                consecutive_errors += 1;
                last_error = Some(error.to_string());
                interval = widen(interval);
                debug!(
                    condition = %description,
                    consecutive_errors,
                    next_interval_ms = interval.as_millis() as u64,
                    "predicate errored, backing off"
                );
            }
        }

        if started.elapsed() >= settings.timeout {
            return Err(WaitTimeout {
                description,
                timeout: settings.timeout,
                last_error,
            });
        }

        // Keep the cadence: a slow predicate eats into its own interval.
        let sleep = interval.saturating_sub(poll_started.elapsed());
        tokio::time::sleep(sleep).await;
    }
}

fn widen(interval: Duration) -> Duration {
    (interval * 2).min(MAX_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    fn settings(timeout_ms: u64, interval_ms: u64) -> PollSettings {
        PollSettings::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_predicate_holds() {
        let mut polls = 0;
        let result = wait_until(settings(1000, 50), "three polls", || {
            polls += 1;
            let done = polls >= 3;
            async move { Ok::<_, Infallible>(done) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_tight_within_one_interval() {
        let started = Instant::now();
        let result = wait_until(settings(1000, 100), "never", || async {
            Ok::<_, Infallible>(false)
        })
        .await;
        let elapsed = started.elapsed();

        let err = result.unwrap_err();
        assert_eq!(err.description, "never");
        assert!(elapsed >= Duration::from_millis(1000), "failed early: {elapsed:?}");
        assert!(
            elapsed <= Duration::from_millis(1100) + Duration::from_millis(10),
            "failed late: {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn errors_widen_the_interval_up_to_the_cap() {
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = stamps.clone();
        let result = wait_until(settings(30_000, 100), "always errors", move || {
            recorded.lock().unwrap().push(Instant::now());
            async { Err::<bool, _>("backend down") }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.last_error.as_deref(), Some("backend down"));

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<u128> = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        // 200, 400, 800, 1600, 3200, then pinned at the 5000ms cap.
        assert_eq!(gaps[0], 200);
        assert_eq!(gaps[1], 400);
        assert_eq!(gaps[2], 800);
        assert!(gaps.iter().all(|g| *g <= 5000));
        assert!(gaps.iter().any(|g| *g == 5000));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_interval_to_base() {
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = stamps.clone();
        let mut polls = 0;
        wait_until(settings(60_000, 100), "recovers", move || {
            polls += 1;
            recorded.lock().unwrap().push(Instant::now());
            // Two errors, one quiet poll, then success.
            let outcome = match polls {
                1 | 2 => Err("flaky"),
                3 => Ok(false),
                _ => Ok(true),
            };
            async move { outcome }
        })
        .await
        .unwrap();

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<u128> = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        assert_eq!(gaps, vec![200, 400, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_predicate_does_not_stretch_the_cadence() {
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = stamps.clone();
        let mut polls = 0;
        wait_until(settings(10_000, 100), "slow predicate", move || {
            polls += 1;
            recorded.lock().unwrap().push(Instant::now());
            let done = polls >= 4;
            async move {
                // Predicate burns 80ms of its 100ms interval.
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok::<_, Infallible>(done)
            }
        })
        .await
        .unwrap();

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<u128> = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        // Poll starts stay one interval apart, not interval + predicate time.
        assert_eq!(gaps, vec![100, 100, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waits_keep_independent_loop_state() {
        let fast = wait_until(settings(1000, 10), "fast", || async {
            Ok::<_, Infallible>(true)
        });
        let mut polls = 0;
        let slow = wait_until(settings(1000, 10), "slow", move || {
            polls += 1;
            let done = polls >= 20;
            async move { Ok::<_, Infallible>(done) }
        });
        let (fast, slow) = tokio::join!(fast, slow);
        assert!(fast.is_ok());
        assert!(slow.is_ok());
    }
}
