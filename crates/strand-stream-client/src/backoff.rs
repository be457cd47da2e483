// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reconnect backoff: capped exponential growth with random jitter.

use rand::Rng;
use std::time::Duration;
use strand_app_core::prefs::ReconnectPrefs;
use tracing::warn;

/// Reconnect settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay, applied symmetrically.
    pub jitter: f64,
    /// Consecutive failures tolerated before giving up; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectPrefs::default())
    }
}

impl From<&ReconnectPrefs> for ReconnectConfig {
    fn from(prefs: &ReconnectPrefs) -> Self {
        Self {
            initial_delay: Duration::from_millis(prefs.initial_ms),
            max_delay: Duration::from_millis(prefs.max_ms),
            multiplier: prefs.multiplier.max(1.0),
            jitter: prefs.jitter.clamp(0.0, 1.0),
            max_retries: prefs.max_retries,
        }
    }
}

/// Retry state for one connection.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    /// Start at the initial delay.
    pub fn new(config: ReconnectConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            attempt: 0,
            current,
        }
    }

    /// Failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget past failures after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.config.initial_delay;
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.config.max_retries.is_some_and(|max| self.attempt >= max) {
            warn!(attempts = self.attempt, "reconnect retries exhausted");
            return None;
        }
        self.attempt += 1;

        let base = self.current;
        let delay = if self.config.jitter > 0.0 {
            let spread = self.config.jitter;
            let factor = (1.0 + rand::thread_rng().gen_range(-spread..=spread)).max(0.0);
            base.mul_f64(factor)
        } else {
            base
        };
        let delay = delay.min(self.config.max_delay);

        let next_ms = (self.current.as_millis() as f64 * self.config.multiplier) as u64;
        self.current = Duration::from_millis(next_ms).min(self.config.max_delay);
        Some(delay)
    }
}
