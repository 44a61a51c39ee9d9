// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

/// The timing and attempt-count configuration for retried calls.
///
/// Retry delays grow exponentially from [initial_retry_delay] by
/// [retry_delay_multiplier] up to [max_retry_delay]; the delay actually slept
/// is jittered, drawn uniformly from `[0, delay]`. Attempt timeouts grow the
/// same way. The call as a whole is bounded by [total_timeout] (wall clock,
/// from the start of the first attempt) and by [max_attempts].
///
/// Use the builder to create instances:
///
/// ```
/// # use unary_callable::retry_settings::RetrySettings;
/// # use std::time::Duration;
/// let settings = RetrySettings::builder()
///     .with_initial_retry_delay(Duration::from_millis(100))
///     .with_retry_delay_multiplier(1.5)
///     .with_max_retry_delay(Duration::from_secs(10))
///     .with_max_attempts(5)
///     .build()?;
/// # Ok::<(), unary_callable::retry_settings::BuildError>(())
/// ```
///
/// [initial_retry_delay]: RetrySettingsBuilder::with_initial_retry_delay
/// [retry_delay_multiplier]: RetrySettingsBuilder::with_retry_delay_multiplier
/// [max_retry_delay]: RetrySettingsBuilder::with_max_retry_delay
/// [total_timeout]: RetrySettingsBuilder::with_total_timeout
/// [max_attempts]: RetrySettingsBuilder::with_max_attempts
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    pub(crate) initial_retry_delay: Duration,
    pub(crate) retry_delay_multiplier: f64,
    pub(crate) max_retry_delay: Duration,
    pub(crate) initial_attempt_timeout: Option<Duration>,
    pub(crate) attempt_timeout_multiplier: f64,
    pub(crate) max_attempt_timeout: Option<Duration>,
    pub(crate) total_timeout: Option<Duration>,
    pub(crate) max_attempts: u32,
}

impl RetrySettings {
    pub fn builder() -> RetrySettingsBuilder {
        RetrySettingsBuilder::new()
    }

    pub fn initial_retry_delay(&self) -> Duration {
        self.initial_retry_delay
    }

    pub fn retry_delay_multiplier(&self) -> f64 {
        self.retry_delay_multiplier
    }

    pub fn max_retry_delay(&self) -> Duration {
        self.max_retry_delay
    }

    pub fn initial_attempt_timeout(&self) -> Option<Duration> {
        self.initial_attempt_timeout
    }

    pub fn attempt_timeout_multiplier(&self) -> f64 {
        self.attempt_timeout_multiplier
    }

    pub fn max_attempt_timeout(&self) -> Option<Duration> {
        self.max_attempt_timeout
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout
    }

    /// The maximum number of attempts, first attempt included. Zero means
    /// the attempt count is unbounded.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_secs(1),
            retry_delay_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(60),
            initial_attempt_timeout: None,
            attempt_timeout_multiplier: 1.0,
            max_attempt_timeout: None,
            total_timeout: None,
            max_attempts: 0,
        }
    }
}

/// A builder for [RetrySettings].
#[derive(Clone, Debug)]
pub struct RetrySettingsBuilder {
    settings: RetrySettings,
}

impl RetrySettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: RetrySettings::default(),
        }
    }

    /// The delay before the second attempt, and the base for exponential
    /// growth. Must be greater than zero.
    pub fn with_initial_retry_delay<V: Into<Duration>>(mut self, v: V) -> Self {
        self.settings.initial_retry_delay = v.into();
        self
    }

    /// The factor applied to the previous retry delay. Must be >= 1.0.
    pub fn with_retry_delay_multiplier(mut self, v: f64) -> Self {
        self.settings.retry_delay_multiplier = v;
        self
    }

    /// The upper bound on any retry delay. Must be at least the initial
    /// retry delay.
    pub fn with_max_retry_delay<V: Into<Duration>>(mut self, v: V) -> Self {
        self.settings.max_retry_delay = v.into();
        self
    }

    /// The timeout applied to the first attempt. When unset, attempts are
    /// bounded only by the total timeout.
    pub fn with_initial_attempt_timeout<V: Into<Duration>>(mut self, v: V) -> Self {
        self.settings.initial_attempt_timeout = Some(v.into());
        self
    }

    /// The factor applied to the previous attempt timeout. Must be >= 1.0.
    pub fn with_attempt_timeout_multiplier(mut self, v: f64) -> Self {
        self.settings.attempt_timeout_multiplier = v;
        self
    }

    /// The upper bound on any attempt timeout.
    pub fn with_max_attempt_timeout<V: Into<Duration>>(mut self, v: V) -> Self {
        self.settings.max_attempt_timeout = Some(v.into());
        self
    }

    /// The wall-clock budget for the logical call, measured from the start
    /// of the first attempt. Sleeps and attempts that would run past it are
    /// not started.
    pub fn with_total_timeout<V: Into<Duration>>(mut self, v: V) -> Self {
        self.settings.total_timeout = Some(v.into());
        self
    }

    /// The maximum number of attempts, first attempt included. Zero (the
    /// default) leaves the count unbounded.
    pub fn with_max_attempts(mut self, v: u32) -> Self {
        self.settings.max_attempts = v;
        self
    }

    pub fn build(self) -> Result<RetrySettings, BuildError> {
        let s = self.settings;
        if s.initial_retry_delay.is_zero() {
            return Err(BuildError::InvalidInitialDelay(s.initial_retry_delay));
        }
        if !s.retry_delay_multiplier.is_finite() || s.retry_delay_multiplier < 1.0 {
            return Err(BuildError::InvalidMultiplier(s.retry_delay_multiplier));
        }
        if !s.attempt_timeout_multiplier.is_finite() || s.attempt_timeout_multiplier < 1.0 {
            return Err(BuildError::InvalidMultiplier(s.attempt_timeout_multiplier));
        }
        if s.max_retry_delay < s.initial_retry_delay {
            return Err(BuildError::EmptyDelayRange {
                maximum: s.max_retry_delay,
                initial: s.initial_retry_delay,
            });
        }
        if let (Some(initial), Some(maximum)) = (s.initial_attempt_timeout, s.max_attempt_timeout) {
            if maximum < initial {
                return Err(BuildError::EmptyTimeoutRange { maximum, initial });
            }
        }
        Ok(s)
    }
}

impl Default for RetrySettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The errors detected validating [RetrySettings].
#[derive(thiserror::Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum BuildError {
    #[error("the initial retry delay must be greater than zero, got {0:?}")]
    InvalidInitialDelay(Duration),
    #[error("multipliers must be finite and >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("the maximum retry delay ({maximum:?}) is less than the initial delay ({initial:?})")]
    EmptyDelayRange { maximum: Duration, initial: Duration },
    #[error(
        "the maximum attempt timeout ({maximum:?}) is less than the initial timeout ({initial:?})"
    )]
    EmptyTimeoutRange { maximum: Duration, initial: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn defaults() -> anyhow::Result<()> {
        let settings = RetrySettings::builder().build()?;
        assert_eq!(settings.initial_retry_delay(), Duration::from_secs(1));
        assert_eq!(settings.max_retry_delay(), Duration::from_secs(60));
        assert_eq!(settings.retry_delay_multiplier(), 2.0);
        assert_eq!(settings.max_attempts(), 0);
        assert_eq!(settings.total_timeout(), None);
        assert_eq!(settings.initial_attempt_timeout(), None);
        Ok(())
    }

    #[test]
    fn full() -> anyhow::Result<()> {
        let settings = RetrySettings::builder()
            .with_initial_retry_delay(Duration::from_millis(2))
            .with_retry_delay_multiplier(1.0)
            .with_max_retry_delay(Duration::from_millis(2))
            .with_initial_attempt_timeout(Duration::from_millis(2))
            .with_attempt_timeout_multiplier(1.0)
            .with_max_attempt_timeout(Duration::from_millis(2))
            .with_total_timeout(Duration::from_millis(10))
            .with_max_attempts(6)
            .build()?;
        assert_eq!(settings.total_timeout(), Some(Duration::from_millis(10)));
        assert_eq!(settings.max_attempts(), 6);
        Ok(())
    }

    #[test]
    fn zero_initial_delay() {
        let result = RetrySettings::builder()
            .with_initial_retry_delay(Duration::ZERO)
            .build();
        assert!(
            matches!(result, Err(BuildError::InvalidInitialDelay(_))),
            "{result:?}"
        );
    }

    #[test_case(0.0)]
    #[test_case(0.99)]
    #[test_case(-1.0)]
    #[test_case(f64::NAN)]
    #[test_case(f64::INFINITY)]
    fn bad_delay_multiplier(multiplier: f64) {
        let result = RetrySettings::builder()
            .with_retry_delay_multiplier(multiplier)
            .build();
        assert!(
            matches!(result, Err(BuildError::InvalidMultiplier(_))),
            "{result:?}"
        );
    }

    #[test_case(0.5)]
    #[test_case(f64::NAN)]
    fn bad_timeout_multiplier(multiplier: f64) {
        let result = RetrySettings::builder()
            .with_attempt_timeout_multiplier(multiplier)
            .build();
        assert!(
            matches!(result, Err(BuildError::InvalidMultiplier(_))),
            "{result:?}"
        );
    }

    #[test]
    fn empty_delay_range() {
        let result = RetrySettings::builder()
            .with_initial_retry_delay(Duration::from_secs(10))
            .with_max_retry_delay(Duration::from_secs(1))
            .build();
        assert!(
            matches!(result, Err(BuildError::EmptyDelayRange { .. })),
            "{result:?}"
        );
    }

    #[test]
    fn empty_timeout_range() {
        let result = RetrySettings::builder()
            .with_initial_attempt_timeout(Duration::from_secs(10))
            .with_max_attempt_timeout(Duration::from_secs(1))
            .build();
        assert!(
            matches!(result, Err(BuildError::EmptyTimeoutRange { .. })),
            "{result:?}"
        );
    }
}
