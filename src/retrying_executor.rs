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

use crate::clock::Clock;
use crate::retry_algorithm::RetryAlgorithm;
use crate::retrying_future::{AttemptFn, RetryingFuture};
use std::sync::Arc;

/// Everything an executor needs to run one retried call.
#[derive(Clone, Debug)]
pub struct RetryContext {
    pub(crate) algorithm: RetryAlgorithm,
    pub(crate) clock: Arc<dyn Clock>,
}

impl RetryContext {
    pub fn new(algorithm: RetryAlgorithm, clock: Arc<dyn Clock>) -> Self {
        Self { algorithm, clock }
    }
}

/// Places the attempt loop of a retried call.
///
/// Both strategies drive the identical loop; they differ only in where it
/// runs. [DirectRetryingExecutor] runs it inline in the returned future, so
/// backoff sleeps occupy the awaiting task. [ScheduledRetryingExecutor]
/// spawns it, so attempts and timers progress whether or not the caller is
/// polling, and the returned handle can be cancelled from the outside.
pub trait RetryingExecutor<T>: Send + Sync + std::fmt::Debug {
    fn submit(&self, context: RetryContext, attempt: AttemptFn<T>) -> RetryingFuture<T>;
}

/// Runs the attempt loop on the task awaiting the returned future.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectRetryingExecutor;

impl<T: Send + 'static> RetryingExecutor<T> for DirectRetryingExecutor {
    fn submit(&self, context: RetryContext, attempt: AttemptFn<T>) -> RetryingFuture<T> {
        RetryingFuture::inline(context.algorithm, context.clock, attempt)
    }
}

/// Runs the attempt loop in a spawned task on the current tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScheduledRetryingExecutor;

impl<T: Send + 'static> RetryingExecutor<T> for ScheduledRetryingExecutor {
    fn submit(&self, context: RetryContext, attempt: AttemptFn<T>) -> RetryingFuture<T> {
        RetryingFuture::spawned(context.algorithm, context.clock, attempt)
    }
}
