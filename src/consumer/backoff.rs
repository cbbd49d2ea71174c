use std::time::Duration;

use crate::config::ConsumerConfig;

/// Idle-poll delay that grows linearly on consecutive empty or failed reads.
///
/// The n-th consecutive wait is `wait_interval + n * back_off_increment`,
/// never longer than `max_wait`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    increment: Duration,
    cap: Duration,
    misses: u32,
}

impl Backoff {
    pub fn new(base: Duration, increment: Duration, cap: Duration) -> Self {
        Self {
            base,
            increment,
            cap: cap.max(base),
            misses: 0,
        }
    }

    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self::new(
            config.wait_interval,
            config.back_off_increment,
            config.max_wait,
        )
    }

    /// Delay before the next poll, counting this one as a miss.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .increment
            .checked_mul(self.misses)
            .and_then(|grown| self.base.checked_add(grown))
            .map_or(self.cap, |delay| delay.min(self.cap));
        self.misses = self.misses.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.misses = 0;
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }
}
