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

use crate::error::{Code, Error};
use crate::retry_settings::RetrySettings;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The timing of a single attempt within a retried call.
///
/// The attempt loop threads these through [RetryAlgorithm::next_attempt] to
/// derive the timing of the following attempt. `retry_delay` is the
/// un-jittered backoff value the exponential series produced;
/// `randomized_retry_delay` is the value actually slept before the attempt,
/// drawn uniformly from `[0, retry_delay]`.
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptSettings {
    pub attempt_number: u32,
    pub first_attempt_start: Instant,
    pub retry_delay: Duration,
    pub randomized_retry_delay: Duration,
    pub attempt_timeout: Option<Duration>,
}

/// The outcome of consulting the [RetryAlgorithm] after a failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryDecision {
    /// Sleep the randomized delay and issue the attempt described by the
    /// enclosed settings.
    Retry(AttemptSettings),
    /// The error is not retryable; fail the call with it.
    Permanent,
    /// The total time budget cannot accommodate another attempt.
    DeadlineExceeded,
    /// The configured attempt count is consumed.
    AttemptsExhausted,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, RetryDecision::Permanent)
    }
}

/// Decides whether and when a failed call is attempted again.
///
/// An error is retryable only when its [code][Error::code] is in the set the
/// application declared via
/// [retryable_on][crate::callable::UnaryCallable::retryable_on]. Retryable
/// deadline-exceeded failures are special: the expired attempt already
/// consumed its share of the time budget, so the next attempt starts with no
/// backoff sleep at all.
#[derive(Clone, Debug)]
pub struct RetryAlgorithm {
    settings: RetrySettings,
    retryable: Arc<HashSet<Code>>,
}

impl RetryAlgorithm {
    pub fn new<I>(settings: RetrySettings, retryable: I) -> Self
    where
        I: IntoIterator<Item = Code>,
    {
        Self {
            settings,
            retryable: Arc::new(retryable.into_iter().collect()),
        }
    }

    /// The settings for the first attempt: no delay, the initial attempt
    /// timeout clamped to the total budget.
    pub fn first_attempt(&self, now: Instant) -> AttemptSettings {
        let attempt_timeout = match (self.timeout_series(0), self.settings.total_timeout) {
            (None, total) => total,
            (Some(t), None) => Some(t),
            (Some(t), Some(total)) => Some(t.min(total)),
        };
        AttemptSettings {
            attempt_number: 0,
            first_attempt_start: now,
            retry_delay: Duration::ZERO,
            randomized_retry_delay: Duration::ZERO,
            attempt_timeout,
        }
    }

    /// Decides the fate of the call after the attempt described by
    /// `previous` failed with `error`.
    pub fn next_attempt(
        &self,
        previous: &AttemptSettings,
        error: &Error,
        now: Instant,
    ) -> RetryDecision {
        let code = match error.code() {
            Some(code) if self.retryable.contains(&code) => code,
            _ => return RetryDecision::Permanent,
        };
        let max_attempts = self.settings.max_attempts;
        if max_attempts > 0 && previous.attempt_number + 2 > max_attempts {
            return RetryDecision::AttemptsExhausted;
        }

        let attempt_number = previous.attempt_number + 1;
        let retry_delay = self.delay_series(attempt_number);
        // An attempt that ran out its deadline already used up its slice of
        // the budget; retry it without sleeping again.
        let randomized_retry_delay = if code == Code::DeadlineExceeded {
            Duration::ZERO
        } else {
            jittered(retry_delay, &mut rand::rng())
        };

        let mut attempt_timeout = self.timeout_series(attempt_number);
        if let Some(total) = self.settings.total_timeout {
            let deadline = previous.first_attempt_start + total;
            let wakeup = now + randomized_retry_delay;
            if wakeup >= deadline {
                return RetryDecision::DeadlineExceeded;
            }
            let remaining = deadline - wakeup;
            attempt_timeout = Some(attempt_timeout.map_or(remaining, |t| t.min(remaining)));
        }

        RetryDecision::Retry(AttemptSettings {
            attempt_number,
            first_attempt_start: previous.first_attempt_start,
            retry_delay,
            randomized_retry_delay,
            attempt_timeout,
        })
    }

    /// The un-jittered delay preceding attempt `attempt_number`.
    fn delay_series(&self, attempt_number: u32) -> Duration {
        let initial = self.settings.initial_retry_delay;
        let maximum = self.settings.max_retry_delay;
        let scaling = self
            .settings
            .retry_delay_multiplier
            .powi(attempt_number.saturating_sub(1) as i32);
        if scaling >= maximum.div_duration_f64(initial) {
            maximum
        } else {
            initial.mul_f64(scaling)
        }
    }

    /// The grown (but not budget-clamped) timeout for attempt
    /// `attempt_number`, when attempt timeouts are configured.
    fn timeout_series(&self, attempt_number: u32) -> Option<Duration> {
        let initial = self.settings.initial_attempt_timeout?;
        let scaling = self
            .settings
            .attempt_timeout_multiplier
            .powi(attempt_number as i32);
        let grown = Duration::try_from_secs_f64(initial.as_secs_f64() * scaling)
            .unwrap_or(Duration::MAX);
        Some(match self.settings.max_attempt_timeout {
            Some(maximum) => grown.min(maximum),
            None => grown,
        })
    }
}

fn jittered(delay: Duration, rng: &mut impl rand::Rng) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    rng.random_range(Duration::ZERO..=delay)
}
