//! When a batch the collector refused is sent again

use std::time::Duration;

use rand::Rng;

/// Resend schedule for batches that hit a transient collector failure
///
/// A batch is sent at most `max_sends` times. Permanent failures (4xx other
/// than 429, missing API key) drop the batch after the first send whatever
/// is left of the schedule.
///
/// ```
/// use interlace::{RetryPolicy, TracerConfig};
/// use std::time::Duration;
///
/// // Give a flaky collector three tries, half a second apart
/// let config = TracerConfig::default()
///     .with_retry(RetryPolicy::fixed(Duration::from_millis(500), 3));
///
/// assert!(config.retry.can_resend(2));
/// assert!(!config.retry.can_resend(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Sends per batch, counting the first one
    pub max_sends: u32,
    pub first_wait: Duration,
    pub max_wait: Duration,
    /// Each wait is the previous one times this
    pub multiplier: f64,
    /// Share of each wait randomised up or down, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Five sends; waits of 1s, 2s, 4s, 8s give or take 10%, never over 30s
    pub fn exponential() -> Self {
        Self {
            max_sends: 5,
            first_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    pub fn send_once() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    pub fn fixed(wait: Duration, max_sends: u32) -> Self {
        Self {
            max_sends: max_sends.max(1),
            first_wait: wait,
            max_wait: wait,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_sends(mut self, max_sends: u32) -> Self {
        self.max_sends = max_sends.max(1);
        self
    }

    /// First wait and the ceiling the growth stops at
    pub fn with_waits(mut self, first: Duration, max: Duration) -> Self {
        self.first_wait = first;
        self.max_wait = max.max(first);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Pause before the `send`-th send of a batch (1-based)
    pub fn wait_before(&self, send: u32) -> Duration {
        let resends = match send.checked_sub(2) {
            Some(n) => n.min(i32::MAX as u32) as i32,
            None => return Duration::ZERO,
        };

        let grown = self.first_wait.as_secs_f64() * self.multiplier.max(1.0).powi(resends);
        let wait = grown.min(self.max_wait.as_secs_f64());
        if self.jitter <= 0.0 || wait <= 0.0 {
            return Duration::from_secs_f64(wait);
        }

        let spread = wait * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((wait + offset).max(0.0))
    }

    /// True while a batch that has been sent `sends` times may go out again
    pub fn can_resend(&self, sends: u32) -> bool {
        sends < self.max_sends
    }
}
