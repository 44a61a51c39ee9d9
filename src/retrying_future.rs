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

use crate::Result;
use crate::clock::Clock;
use crate::error::Error;
use crate::retry_algorithm::{AttemptSettings, RetryAlgorithm, RetryDecision};
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

/// Produces the future for one attempt, given its timing.
pub type AttemptFn<T> =
    Box<dyn FnMut(AttemptSettings) -> BoxFuture<'static, Result<T>> + Send + 'static>;

/// The observable phase of a retried call.
///
/// A call reaches exactly one of the terminal states (`Succeeded`, `Failed`,
/// `Cancelled`), exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryState {
    NotStarted,
    AttemptInProgress,
    BetweenAttempts,
    Succeeded,
    Failed,
    Cancelled,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::Succeeded | RetryState::Failed | RetryState::Cancelled
        )
    }
}

#[derive(Debug)]
struct Progress {
    state: RetryState,
    attempt: Option<AttemptSettings>,
}

type SharedProgress = Arc<Mutex<Progress>>;

fn set_progress(progress: &SharedProgress, state: RetryState, attempt: Option<AttemptSettings>) {
    let mut guard = progress.lock().unwrap_or_else(|p| p.into_inner());
    guard.state = state;
    if attempt.is_some() {
        guard.attempt = attempt;
    }
}

/// A handle to a retried call.
///
/// Resolves to the final outcome of the attempt loop. The handle also
/// exposes the loop's progress ([state][RetryingFuture::state], the most
/// recent [attempt_settings][RetryingFuture::attempt_settings]) and supports
/// [cancellation][RetryingFuture::cancel]: cancelling stops the in-flight
/// attempt, the backoff timer, and any further scheduling, and resolves the
/// future with [Error::cancelled].
pub struct RetryingFuture<T> {
    inner: Inner<T>,
    progress: SharedProgress,
    token: CancellationToken,
}

enum Inner<T> {
    /// The attempt loop itself; driven by whoever awaits the handle.
    Inline(BoxFuture<'static, Result<T>>),
    /// The attempt loop runs in a spawned task; the handle awaits its
    /// completion.
    Task(tokio::task::JoinHandle<Result<T>>),
}

impl<T: Send + 'static> RetryingFuture<T> {
    pub(crate) fn inline(
        algorithm: RetryAlgorithm,
        clock: Arc<dyn Clock>,
        attempt: AttemptFn<T>,
    ) -> Self {
        let (progress, token) = Self::channels();
        let loop_fut = run_attempts(algorithm, clock, attempt, progress.clone(), token.clone());
        Self {
            inner: Inner::Inline(Box::pin(loop_fut)),
            progress,
            token,
        }
    }

    pub(crate) fn spawned(
        algorithm: RetryAlgorithm,
        clock: Arc<dyn Clock>,
        attempt: AttemptFn<T>,
    ) -> Self {
        let (progress, token) = Self::channels();
        let loop_fut = run_attempts(algorithm, clock, attempt, progress.clone(), token.clone());
        Self {
            inner: Inner::Task(tokio::spawn(loop_fut)),
            progress,
            token,
        }
    }

    fn channels() -> (SharedProgress, CancellationToken) {
        let progress = Arc::new(Mutex::new(Progress {
            state: RetryState::NotStarted,
            attempt: None,
        }));
        (progress, CancellationToken::new())
    }
}

impl<T> RetryingFuture<T> {
    /// Stops the call at the next opportunity. Idempotent; a call that
    /// already reached a terminal state is unaffected.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn state(&self) -> RetryState {
        self.progress.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    /// The timing of the most recently scheduled attempt, if any started.
    pub fn attempt_settings(&self) -> Option<AttemptSettings> {
        self.progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .attempt
            .clone()
    }
}

impl<T> Future for RetryingFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Inline(loop_fut) => loop_fut.as_mut().poll(cx),
            Inner::Task(handle) => match Pin::new(handle).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(e)) => Poll::Ready(Err(Error::cancelled(e))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// The attempt loop shared by both executors. Attempts run strictly one at
/// a time; the backoff sleep and the in-flight attempt are both raced
/// against cancellation.
async fn run_attempts<T>(
    algorithm: RetryAlgorithm,
    clock: Arc<dyn Clock>,
    mut attempt: AttemptFn<T>,
    progress: SharedProgress,
    token: CancellationToken,
) -> Result<T> {
    let mut settings = algorithm.first_attempt(clock.now());
    loop {
        if !settings.randomized_retry_delay.is_zero() {
            set_progress(&progress, RetryState::BetweenAttempts, Some(settings.clone()));
            tokio::select! {
                _ = token.cancelled() => return cancelled(&progress),
                _ = tokio::time::sleep(settings.randomized_retry_delay) => {}
            }
        }
        if token.is_cancelled() {
            return cancelled(&progress);
        }
        set_progress(
            &progress,
            RetryState::AttemptInProgress,
            Some(settings.clone()),
        );
        tracing::trace!(attempt = settings.attempt_number, "starting attempt");

        let attempt_fut = attempt(settings.clone());
        let attempt_timeout = settings.attempt_timeout;
        let bounded = async move {
            match attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt_fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::timeout(format!(
                        "the attempt did not complete within {limit:?}"
                    ))),
                },
                None => attempt_fut.await,
            }
        };
        let outcome = tokio::select! {
            _ = token.cancelled() => return cancelled(&progress),
            outcome = bounded => outcome,
        };

        match outcome {
            Ok(response) => {
                set_progress(&progress, RetryState::Succeeded, None);
                return Ok(response);
            }
            Err(error) => match algorithm.next_attempt(&settings, &error, clock.now()) {
                RetryDecision::Retry(next) => {
                    tracing::debug!(
                        attempt = next.attempt_number,
                        delay = ?next.randomized_retry_delay,
                        "retrying after {error}"
                    );
                    settings = next;
                }
                RetryDecision::Permanent => {
                    set_progress(&progress, RetryState::Failed, None);
                    return Err(error);
                }
                RetryDecision::DeadlineExceeded => {
                    set_progress(&progress, RetryState::Failed, None);
                    return Err(Error::timeout(error));
                }
                RetryDecision::AttemptsExhausted => {
                    set_progress(&progress, RetryState::Failed, None);
                    return Err(Error::exhausted(error));
                }
            },
        }
    }
}

fn cancelled<T>(progress: &SharedProgress) -> Result<T> {
    set_progress(progress, RetryState::Cancelled, None);
    Err(Error::cancelled("the call was cancelled by the application"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::{Code, Status};
    use crate::retry_settings::RetrySettings;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn algorithm(settings: RetrySettings) -> RetryAlgorithm {
        RetryAlgorithm::new(settings, [Code::Unavailable, Code::DeadlineExceeded])
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    fn transient() -> Error {
        Error::rpc(Status::new(Code::Unavailable, "try again"))
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempt: AttemptFn<String> = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok("success".to_string()) }.boxed()
        });
        let mut future = RetryingFuture::inline(
            algorithm(RetrySettings::default()),
            clock(),
            attempt,
        );
        assert_eq!(future.state(), RetryState::NotStarted);
        let response = (&mut future).await;
        assert!(matches!(&response, Ok(s) if s == "success"), "{response:?}");
        assert_eq!(future.state(), RetryState::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(future.attempt_settings().map(|a| a.attempt_number), Some(0));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempt: AttemptFn<String> = Box::new(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok("success".to_string())
                }
            }
            .boxed()
        });
        let future =
            RetryingFuture::inline(algorithm(RetrySettings::default()), clock(), attempt);
        let response = future.await;
        assert!(matches!(&response, Ok(s) if s == "success"), "{response:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_stops_after_one_attempt() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempt: AttemptFn<String> = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::rpc(Status::new(Code::PermissionDenied, "nope"))) }.boxed()
        });
        let future =
            RetryingFuture::inline(algorithm(RetrySettings::default()), clock(), attempt);
        let response = future.await;
        assert!(
            matches!(&response, Err(e) if e.code() == Some(Code::PermissionDenied)),
            "{response:?}"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_the_attempt_budget() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempt: AttemptFn<String> = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }.boxed()
        });
        let settings = RetrySettings::builder().with_max_attempts(3).build()?;
        let future = RetryingFuture::inline(algorithm(settings), clock(), attempt);
        let response = future.await;
        assert!(matches!(&response, Err(e) if e.is_exhausted()), "{response:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_retries_without_sleeping() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempt: AttemptFn<String> = Box::new(move |settings| {
            counter.fetch_add(1, Ordering::SeqCst);
            // The second and later attempts must carry a zero randomized
            // delay; the attempt itself never completes.
            if settings.attempt_number > 0 {
                assert_eq!(settings.randomized_retry_delay, Duration::ZERO);
            }
            futures::future::pending().boxed()
        });
        let settings = RetrySettings::builder()
            .with_initial_attempt_timeout(Duration::from_millis(5))
            .with_max_attempts(2)
            .build()?;
        let future = RetryingFuture::inline(algorithm(settings), clock(), attempt);
        let response = future.await;
        assert!(matches!(&response, Err(e) if e.is_exhausted()), "{response:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    mockall::mock! {
        TestClock {}
        impl Clock for TestClock {
            fn now(&self) -> std::time::Instant;
        }
    }

    impl std::fmt::Debug for MockTestClock {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockTestClock").finish()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_bounds_the_loop() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempt: AttemptFn<String> = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }.boxed()
        });
        // The first attempt starts at t=0 and fails at t=9, past the
        // eight-second budget; no second attempt may start.
        let start = std::time::Instant::now();
        let mut times = [start, start + Duration::from_secs(9)].into_iter();
        let mut clock = MockTestClock::new();
        clock
            .expect_now()
            .times(2)
            .returning(move || times.next().unwrap());
        let settings = RetrySettings::builder()
            .with_total_timeout(Duration::from_secs(8))
            .build()?;
        let future = RetryingFuture::inline(algorithm(settings), Arc::new(clock), attempt);
        let response = future.await;
        assert!(matches!(&response, Err(e) if e.is_timeout()), "{response:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_between_attempts() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempt: AttemptFn<String> = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }.boxed()
        });
        let settings = RetrySettings::builder()
            .with_initial_retry_delay(Duration::from_secs(3600))
            .with_max_retry_delay(Duration::from_secs(3600))
            .build()?;
        let future = RetryingFuture::spawned(algorithm(settings), clock(), attempt);
        // Let the first attempt fail and the loop park in its backoff sleep,
        // without advancing the paused clock.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(future.state(), RetryState::BetweenAttempts);
        future.cancel();
        let response = future.await;
        assert!(matches!(&response, Err(e) if e.is_cancelled()), "{response:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_in_flight_attempt() -> anyhow::Result<()> {
        let attempt: AttemptFn<String> = Box::new(move |_| futures::future::pending().boxed());
        let future =
            RetryingFuture::spawned(algorithm(RetrySettings::default()), clock(), attempt);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(future.state(), RetryState::AttemptInProgress);
        future.cancel();
        let response = future.await;
        assert!(matches!(&response, Err(e) if e.is_cancelled()), "{response:?}");
        Ok(())
    }
}
