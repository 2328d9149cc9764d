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

//! Retry throttling, per gRFC A6.
//!
//! Each server name has a token bucket. Failed attempts take a token and
//! successful ones return a fraction of a token; while the bucket is at or
//! below half full, retries are not attempted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::debug;

use crate::client::service_config::RetryThrottleConfig;

const MILLI_TOKENS_PER_FAILURE: u64 = 1000;

/// A token bucket shared by all calls to one server.
#[derive(Debug)]
pub struct RetryThrottler {
    config: RetryThrottleConfig,
    milli_tokens: AtomicU64,
    // Calls keep the throttler they started with. When a config change
    // installs a new one, their updates are forwarded to it.
    replacement: ArcSwapOption<RetryThrottler>,
}

impl RetryThrottler {
    fn new(config: RetryThrottleConfig, old: Option<&RetryThrottler>) -> Self {
        let initial = match old {
            // Keep the same fraction of tokens as the throttler being replaced.
            Some(old) if old.config.max_milli_tokens > 0 => {
                let old_tokens = old.milli_tokens.load(Ordering::Acquire) as u128;
                (old_tokens * config.max_milli_tokens as u128
                    / old.config.max_milli_tokens as u128) as u64
            }
            _ => config.max_milli_tokens,
        };
        Self {
            config,
            milli_tokens: AtomicU64::new(initial),
            replacement: ArcSwapOption::empty(),
        }
    }

    fn current(self: &Arc<Self>) -> Arc<Self> {
        let mut current = self.clone();
        while let Some(next) = current.replacement.load_full() {
            current = next;
        }
        current
    }

    pub fn config(&self) -> RetryThrottleConfig {
        self.config
    }

    pub fn milli_tokens(self: &Arc<Self>) -> u64 {
        self.current().milli_tokens.load(Ordering::Acquire)
    }

    /// Records a failed attempt. Returns false if retries are now throttled.
    pub fn record_failure(self: &Arc<Self>) -> bool {
        let current = self.current();
        let threshold = current.config.max_milli_tokens / 2;
        let prev = current
            .milli_tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_sub(MILLI_TOKENS_PER_FAILURE))
            })
            .unwrap_or_else(|t| t);
        prev.saturating_sub(MILLI_TOKENS_PER_FAILURE) > threshold
    }

    /// Records a successful attempt.
    pub fn record_success(self: &Arc<Self>) {
        let current = self.current();
        let max = current.config.max_milli_tokens;
        let ratio = current.config.milli_token_ratio;
        let _ = current
            .milli_tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some((t + ratio).min(max))
            });
    }
}

/// Throttlers keyed by server name, shared by every channel in a context.
#[derive(Debug, Default)]
pub struct RetryThrottleMap {
    throttlers: Mutex<HashMap<String, Arc<RetryThrottler>>>,
}

impl RetryThrottleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the throttler for `server_name`, replacing it if `config`
    /// differs from the one it was created with.
    pub fn get(&self, server_name: &str, config: RetryThrottleConfig) -> Arc<RetryThrottler> {
        let mut throttlers = self.throttlers.lock();
        if let Some(existing) = throttlers.get(server_name) {
            if existing.config == config {
                return existing.clone();
            }
            debug!(server = server_name, ?config, "replacing retry throttler");
            let replacement = Arc::new(RetryThrottler::new(config, Some(existing)));
            existing.replacement.store(Some(replacement.clone()));
            throttlers.insert(server_name.to_string(), replacement.clone());
            return replacement;
        }
        let throttler = Arc::new(RetryThrottler::new(config, None));
        throttlers.insert(server_name.to_string(), throttler.clone());
        throttler
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_tokens: u64, ratio_milli: u64) -> RetryThrottleConfig {
        RetryThrottleConfig {
            max_milli_tokens: max_tokens * 1000,
            milli_token_ratio: ratio_milli,
        }
    }

    #[test]
    fn throttles_below_half() {
        let map = RetryThrottleMap::new();
        let t = map.get("server", config(4, 500));
        // 4 -> 3 -> 2 tokens; 2 is not above half of 4.
        assert!(t.record_failure());
        assert!(!t.record_failure());
        assert_eq!(t.milli_tokens(), 2000);

        // Successes refill by the ratio, capped at the max.
        t.record_success();
        assert_eq!(t.milli_tokens(), 2500);
        assert!(!t.record_failure());
        assert_eq!(t.milli_tokens(), 1500);
        for _ in 0..10 {
            t.record_success();
        }
        assert_eq!(t.milli_tokens(), 4000);
    }

    #[test]
    fn tokens_never_go_negative() {
        let map = RetryThrottleMap::new();
        let t = map.get("server", config(1, 100));
        for _ in 0..5 {
            assert!(!t.record_failure());
        }
        assert_eq!(t.milli_tokens(), 0);
    }

    #[test]
    fn same_config_is_shared() {
        let map = RetryThrottleMap::new();
        let a = map.get("server", config(10, 100));
        let b = map.get("server", config(10, 100));
        assert!(Arc::ptr_eq(&a, &b));
        let other = map.get("other", config(10, 100));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn replacement_keeps_token_fraction() {
        let map = RetryThrottleMap::new();
        let old = map.get("server", config(10, 100));
        for _ in 0..4 {
            old.record_failure();
        }
        assert_eq!(old.milli_tokens(), 6000);

        let new = map.get("server", config(20, 100));
        assert_eq!(new.config().max_milli_tokens, 20_000);
        assert_eq!(new.milli_tokens(), 12_000);

        // Calls still holding the old throttler update the new one.
        old.record_failure();
        assert_eq!(new.milli_tokens(), 11_000);
    }
}
