//! Retry cadence for pod restarts, failed reconcile passes and transient API calls.
//!
//! Restart delays grow exponentially per `(job, role, index)` slot and are
//! capped. The number of restarts already spent is carried on the pods
//! themselves (attempt annotation), so this module only keeps timing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::kubernetes::JobKey;
use crate::Result;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay before the first restart of a slot
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Restart budget for roles that set neither maxRestarts nor backoffLimit
    pub default_restart_limit: i32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            default_restart_limit: 3,
        }
    }
}

impl BackoffConfig {
    /// Delay after the `consecutive`-th failure in a row. Zero failures wait zero.
    pub fn delay(&self, consecutive: u32) -> Duration {
        if consecutive == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi(consecutive.saturating_sub(1).min(63) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Identity of a replica slot; stable across pod recreations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub job: JobKey,
    pub role: String,
    pub index: i32,
}

impl SlotKey {
    pub fn new(job: JobKey, role: impl Into<String>, index: i32) -> Self {
        Self {
            job,
            role: role.into(),
            index,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRestart {
    failed_attempt: u32,
    retry_at: Instant,
}

/// When each failed slot may be recreated.
pub struct RestartTracker {
    config: BackoffConfig,
    slots: Mutex<HashMap<SlotKey, PendingRestart>>,
}

impl RestartTracker {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Time left before the pod that failed on `failed_attempt` may be replaced.
    ///
    /// The first call for a given attempt starts the clock; later calls for the
    /// same attempt keep it, so repeated passes never extend the wait.
    pub fn remaining(&self, slot: &SlotKey, failed_attempt: u32, now: Instant) -> Duration {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        let delay = self.config.delay(failed_attempt + 1);
        let pending = slots
            .entry(slot.clone())
            .and_modify(|p| {
                if p.failed_attempt != failed_attempt {
                    *p = PendingRestart {
                        failed_attempt,
                        retry_at: now + delay,
                    };
                }
            })
            .or_insert(PendingRestart {
                failed_attempt,
                retry_at: now + delay,
            });
        pending.retry_at.saturating_duration_since(now)
    }

    /// Attempt number for a slot recreated after its last recorded failure.
    pub fn next_attempt(&self, slot: &SlotKey) -> u32 {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(slot)
            .map_or(0, |p| p.failed_attempt + 1)
    }

    /// The slot reached Succeeded; its next failure starts from the initial delay.
    pub fn reset(&self, slot: &SlotKey) {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(slot);
    }

    pub fn forget_job(&self, job: &JobKey) {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|slot, _| slot.job != *job);
    }

    pub fn tracked(&self, job: &JobKey) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .filter(|slot| slot.job == *job)
            .count()
    }
}

/// Per-key requeue delay for reconcile passes that returned an error.
pub struct KeyedBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<JobKey, u32>>,
}

impl KeyedBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_delay(&self, key: &JobKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = self.base.saturating_mul(2u32.saturating_pow((*count).min(16)));
        *count += 1;
        delay.min(self.max)
    }

    pub fn reset(&self, key: &JobKey) {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }
}

/// Bounds for [`retry_with_backoff`].
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// `max_attempts` is spent. Delays are jittered between 0.5x and 1.5x.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
