/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Exponential backoff shared by subchannel reconnects and call retries.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BackoffConfig {
    /// The amount of time to backoff after the first failure.
    pub base_delay: Duration,

    /// The factor with which to multiply backoffs after a failure.
    pub multiplier: f64,

    /// The factor with which backoffs are randomized.
    pub jitter: f64,

    /// The upper bound of backoff delay.
    pub max_delay: Duration,
}

/// Connection backoff defaults from
/// https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md.
pub(crate) const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

/// Jitter applied to retry backoff, matching the connection backoff jitter.
pub(crate) const RETRY_BACKOFF_JITTER: f64 = 0.2;

impl BackoffConfig {
    fn validate(&self) -> Result<(), &'static str> {
        // 0 <= base_delay <= max_delay
        if self.base_delay > self.max_delay {
            Err("base_delay must not be greater than max_delay")?;
        }
        // Retry policies may shrink the delay between attempts, so only a
        // non-positive multiplier is rejected.
        if self.multiplier <= 0.0 || !self.multiplier.is_finite() {
            Err("multiplier must be a positive number")?;
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            Err("jitter must be within [0, 1]")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    config: BackoffConfig,

    /// The delay for the next retry, without the random jitter. Stored as f64
    /// to avoid rounding errors.
    next_delay_secs: f64,
}

/// Connection backoff with the default parameters.
impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            config: DEFAULT_EXPONENTIAL_CONFIG,
            next_delay_secs: DEFAULT_EXPONENTIAL_CONFIG.base_delay.as_secs_f64(),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            next_delay_secs,
        })
    }

    pub fn reset(&mut self) {
        self.next_delay_secs = self.config.base_delay.as_secs_f64();
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// backoff.
    pub fn backoff_duration(&mut self) -> Duration {
        let next_delay = self.next_delay_secs;
        let cur_delay = if self.config.jitter == 0.0 {
            next_delay
        } else {
            next_delay * (1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0))
        };
        self.next_delay_secs = self
            .config
            .max_delay
            .as_secs_f64()
            .min(next_delay * self.config.multiplier);
        Duration::from_secs_f64(cur_delay.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(base: u64, multiplier: f64, jitter: f64, max: u64) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_secs(base),
            multiplier,
            jitter,
            max_delay: Duration::from_secs(max),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG).is_ok());
    }

    #[test]
    fn invalid_configs() {
        assert!(ExponentialBackoff::new(config(100, 2.0, 0.0, 10)).is_err());
        assert!(ExponentialBackoff::new(config(1, 0.0, 0.0, 10)).is_err());
        assert!(ExponentialBackoff::new(config(1, -1.5, 0.0, 10)).is_err());
        assert!(ExponentialBackoff::new(config(1, 2.0, -0.1, 10)).is_err());
        assert!(ExponentialBackoff::new(config(1, 2.0, 1.5, 10)).is_err());
    }

    #[test]
    fn grows_until_capped_then_resets() {
        let mut backoff = ExponentialBackoff::new(config(1, 2.0, 0.0, 15)).unwrap();
        let delays: Vec<_> = (0..6).map(|_| backoff.backoff_duration().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 15, 15]);

        backoff.reset();
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(1));
    }

    #[test]
    fn multiplier_below_one_shrinks() {
        let mut backoff = ExponentialBackoff::new(config(8, 0.5, 0.0, 10)).unwrap();
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(8));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(4));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut backoff =
            ExponentialBackoff::new(config(1, 2.0, RETRY_BACKOFF_JITTER, 15)).unwrap();
        for expected in [1.0, 2.0, 4.0] {
            let d = backoff.backoff_duration().as_secs_f64();
            assert!(d >= expected * 0.8 - 1e-9, "{d} too small");
            assert!(d <= expected * 1.2 + 1e-9, "{d} too large");
        }
    }
}
