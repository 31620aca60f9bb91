//! Configuration for the engine.

use crate::error::{EngineError, EngineResult};
use std::time::Duration;

/// Configuration for the engine and its polling loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lower bound on the delay between ticks while work is pending.
    pub min_delay: Duration,
    /// Lower bound on the delay between ticks while idle (ping only).
    pub slow_min_delay: Duration,
    /// Weight of the latest round trip in the moving average.
    pub ema_alpha: f64,
    /// Whether to apply `min_delay` as a floor in fast mode.
    pub clamp: bool,
    /// Default bound on schema expansion depth.
    pub max_depth: usize,
    /// Capacity of each subscription and error broadcast channel.
    pub event_buffer: usize,
    /// Keys read once when the polling loop starts.
    pub initial_keys: Vec<String>,
    /// Logical prefix to transport prefix substitutions.
    pub prefix_map: Vec<(String, String)>,
    /// Automatic retry after a failed batch. `None` waits for `Engine::retry`.
    pub retry: Option<RetryConfig>,
    /// Length in hex digits of correlation hashes.
    pub correlation_hash_len: usize,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            min_delay: Duration::from_millis(10),
            slow_min_delay: Duration::from_secs(5),
            ema_alpha: 0.1,
            clamp: true,
            max_depth: 32,
            event_buffer: 64,
            initial_keys: Vec::new(),
            prefix_map: Vec::new(),
            retry: None,
            correlation_hash_len: 8,
        }
    }

    /// Sets the fast mode delay floor.
    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    /// Sets the slow mode delay floor.
    pub fn with_slow_min_delay(mut self, delay: Duration) -> Self {
        self.slow_min_delay = delay;
        self
    }

    /// Sets the moving average weight.
    pub fn with_ema_alpha(mut self, alpha: f64) -> Self {
        self.ema_alpha = alpha;
        self
    }

    /// Enables or disables the fast mode floor.
    pub fn with_clamp(mut self, clamp: bool) -> Self {
        self.clamp = clamp;
        self
    }

    /// Sets the default expansion depth bound.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Sets the broadcast channel capacity.
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Adds a key to warm the cache with at startup.
    pub fn with_initial_key(mut self, key: impl Into<String>) -> Self {
        self.initial_keys.push(key.into());
        self
    }

    /// Adds a prefix substitution.
    pub fn with_prefix(mut self, logical: impl Into<String>, transport: impl Into<String>) -> Self {
        self.prefix_map.push((logical.into(), transport.into()));
        self
    }

    /// Enables automatic retry after failed batches.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the correlation hash length.
    pub fn with_correlation_hash_len(mut self, len: usize) -> Self {
        self.correlation_hash_len = len;
        self
    }

    /// Checks that the values are usable.
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "ema_alpha must be in (0, 1], got {}",
                self.ema_alpha
            )));
        }
        if self.event_buffer == 0 {
            return Err(EngineError::InvalidConfig(
                "event_buffer must be > 0".into(),
            ));
        }
        if !(1..=64).contains(&self.correlation_hash_len) {
            return Err(EngineError::InvalidConfig(format!(
                "correlation_hash_len must be in 1..=64, got {}",
                self.correlation_hash_len
            )));
        }
        if self.slow_min_delay < self.min_delay {
            return Err(EngineError::InvalidConfig(
                "slow_min_delay must not be shorter than min_delay".into(),
            ));
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff applied by the polling loop after a failed batch.
///
/// After `n` consecutive failures the loop sleeps `first_delay * factor^(n-1)`,
/// capped at `ceiling`. Once `attempts` failures have piled up it parks
/// until [`Engine::retry`](crate::Engine::retry) is called.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Consecutive failed batches tolerated before parking.
    pub attempts: u32,
    /// Sleep after the first failure.
    pub first_delay: Duration,
    /// Upper bound on any single sleep.
    pub ceiling: Duration,
    /// Growth of the sleep per further failure; at least 1.
    pub factor: f64,
}

impl RetryConfig {
    /// Retries up to `attempts` times, starting at 250ms and doubling up to 10s.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(10),
            factor: 2.0,
        }
    }

    /// Retries forever at a fixed interval.
    pub fn steady(interval: Duration) -> Self {
        Self {
            attempts: u32::MAX,
            first_delay: interval,
            ceiling: interval,
            factor: 1.0,
        }
    }

    /// Sets the sleep after the first failure.
    pub fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = delay;
        self
    }

    /// Sets the cap on a single sleep.
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Sets the growth factor.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Returns true if the loop may retry on its own after `failures` failures.
    pub fn permits(&self, failures: u32) -> bool {
        failures < self.attempts
    }

    /// Sleep before the next batch after `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let scaled = self.first_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(scaled)
            .map(|delay| delay.min(self.ceiling))
            .unwrap_or(self.ceiling)
    }

    /// Checks that the backoff is usable.
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.factor.is_finite() && self.factor >= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "retry factor must be finite and >= 1, got {}",
                self.factor
            )));
        }
        if self.first_delay > self.ceiling {
            return Err(EngineError::InvalidConfig(
                "retry first_delay must not exceed its ceiling".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
