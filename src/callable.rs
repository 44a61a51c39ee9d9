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

//! The composable callable: one transport invocation wrapped with channel
//! binding, retries, batching, and paging.

use crate::Result;
use crate::batching::BatcherFactory;
use crate::clock::Clock;
use crate::error::Code;
use crate::paging::{PagedCallable, PagedListDescriptor};
use crate::retry_algorithm::RetryAlgorithm;
use crate::retry_settings::RetrySettings;
use crate::retrying_executor::{RetryContext, RetryingExecutor};
use crate::retrying_future::AttemptFn;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// An opaque handle to the transport resource a call is bound to.
///
/// The framework never interprets a channel, it only threads the handle
/// through the [CallContext] to the transport adaptor, which recovers the
/// concrete type with [downcast_ref][Channel::downcast_ref].
#[derive(Clone)]
pub struct Channel(Arc<dyn Any + Send + Sync>);

impl Channel {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Channel").finish()
    }
}

/// Per-invocation context delivered to the transport adaptor.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    channel: Option<Channel>,
    attempt_timeout: Option<Duration>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// The time budget for this single attempt. Retrying callables set this
    /// so the transport can also enforce the deadline on the wire.
    pub fn set_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }
}

/// The primitive a [UnaryCallable] wraps: issue one request, get one future
/// response.
///
/// Transport adaptors implement this trait; any
/// `Fn(Req, CallContext) -> impl Future` closure gets an implementation for
/// free.
pub trait FutureCallable<Req, Resp>: Send + Sync {
    fn future_call(&self, request: Req, context: CallContext) -> BoxFuture<'static, Result<Resp>>;
}

impl<F, Fut, Req, Resp> FutureCallable<Req, Resp> for F
where
    F: Fn(Req, CallContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Resp>> + Send + 'static,
{
    fn future_call(&self, request: Req, context: CallContext) -> BoxFuture<'static, Result<Resp>> {
        (self)(request, context).boxed()
    }
}

/// A unary call decorated with client-side middleware.
///
/// Middleware composes by wrapping: each decorator returns a new callable
/// and never mutates its inner layer. The conventional order, outermost
/// first, is paging, then retries, then batching, then channel binding:
///
/// ```
/// # use unary_callable::callable::{CallContext, UnaryCallable};
/// # use unary_callable::clock::SystemClock;
/// # use unary_callable::error::Code;
/// # use unary_callable::retry_settings::RetrySettings;
/// # use unary_callable::retrying_executor::ScheduledRetryingExecutor;
/// # use std::sync::Arc;
/// # tokio_test::block_on(async {
/// let callable = UnaryCallable::new(|request: String, _context: CallContext| async move {
///     Ok(request.to_uppercase())
/// });
/// let callable = callable
///     .retryable_on([Code::Unavailable])
///     .retrying(
///         RetrySettings::default(),
///         Arc::new(ScheduledRetryingExecutor),
///         Arc::new(SystemClock),
///     );
/// let response = callable.call("hello".to_string()).await?;
/// assert_eq!(response, "HELLO");
/// # Ok::<(), unary_callable::error::Error>(())
/// # });
/// ```
pub struct UnaryCallable<Req, Resp> {
    inner: Arc<dyn FutureCallable<Req, Resp>>,
    retryable: Arc<HashSet<Code>>,
}

impl<Req, Resp> Clone for UnaryCallable<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            retryable: self.retryable.clone(),
        }
    }
}

impl<Req, Resp> std::fmt::Debug for UnaryCallable<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryCallable")
            .field("retryable", &self.retryable)
            .finish()
    }
}

impl<Req, Resp> UnaryCallable<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<C>(inner: C) -> Self
    where
        C: FutureCallable<Req, Resp> + 'static,
    {
        Self {
            inner: Arc::new(inner),
            retryable: Arc::new(HashSet::new()),
        }
    }

    /// Issues the call and awaits its outcome.
    pub async fn call(&self, request: Req) -> Result<Resp> {
        self.call_with_context(request, CallContext::default()).await
    }

    pub async fn call_with_context(&self, request: Req, context: CallContext) -> Result<Resp> {
        self.inner.future_call(request, context).await
    }

    /// Issues the call and returns a future for its outcome.
    pub fn future_call(&self, request: Req) -> BoxFuture<'static, Result<Resp>> {
        self.inner.future_call(request, CallContext::default())
    }

    pub fn future_call_with_context(
        &self,
        request: Req,
        context: CallContext,
    ) -> BoxFuture<'static, Result<Resp>> {
        self.inner.future_call(request, context)
    }

    /// Binds the callable to a transport channel. Contexts that already
    /// carry a channel are passed through unchanged.
    pub fn bind(self, channel: Channel) -> Self {
        let inner = self.inner;
        let wrapper = move |request: Req, context: CallContext| {
            let context = if context.channel().is_none() {
                context.set_channel(channel.clone())
            } else {
                context
            };
            inner.future_call(request, context)
        };
        Self {
            inner: Arc::new(wrapper),
            retryable: self.retryable,
        }
    }

    /// Declares which status codes a subsequent [retrying][Self::retrying]
    /// decorator treats as retryable. Without this declaration no failure
    /// is retried.
    pub fn retryable_on<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = Code>,
    {
        self.retryable = Arc::new(codes.into_iter().collect());
        self
    }

    /// Wraps the callable in the retry loop described by `settings`, using
    /// the codes declared via [retryable_on][Self::retryable_on].
    pub fn retrying(
        self,
        settings: RetrySettings,
        executor: Arc<dyn RetryingExecutor<Resp>>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        Req: Clone,
    {
        let algorithm = RetryAlgorithm::new(settings, self.retryable.iter().copied());
        let inner = self.inner;
        let wrapper = move |request: Req, context: CallContext| {
            let retry_context = RetryContext::new(algorithm.clone(), clock.clone());
            let inner = inner.clone();
            let attempt: AttemptFn<Resp> = Box::new(move |attempt_settings| {
                let context = match attempt_settings.attempt_timeout {
                    Some(limit) => context.clone().set_attempt_timeout(limit),
                    None => context.clone(),
                };
                inner.future_call(request.clone(), context)
            });
            executor.submit(retry_context, attempt).boxed()
        };
        Self {
            inner: Arc::new(wrapper),
            retryable: self.retryable,
        }
    }

    /// Wraps the callable in a [Batcher][crate::batching::Batcher] created
    /// from `factory`. With batching disabled in the factory's settings the
    /// callable is returned unchanged and the descriptor is never consulted.
    pub fn batching(self, factory: &BatcherFactory<Req, Resp>) -> Self {
        if !factory.settings().enabled() {
            return self;
        }
        factory.batcher(self).callable()
    }

    /// Adapts the callable to a page-oriented surface described by
    /// `descriptor`.
    pub fn paged<D>(self, descriptor: Arc<D>) -> PagedCallable<D>
    where
        D: PagedListDescriptor<Request = Req, Response = Resp>,
    {
        PagedCallable::new(self, descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::{Error, Status};
    use crate::retrying_executor::DirectRetryingExecutor;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn upper() -> UnaryCallable<String, String> {
        UnaryCallable::new(|request: String, _context: CallContext| async move {
            Ok(request.to_uppercase())
        })
    }

    #[tokio::test]
    async fn call_and_future_call() -> anyhow::Result<()> {
        let callable = upper();
        let response = callable.call("hello".to_string()).await?;
        assert_eq!(response, "HELLO");
        let response = callable.future_call("world".to_string()).await?;
        assert_eq!(response, "WORLD");
        Ok(())
    }

    #[tokio::test]
    async fn bind_exposes_the_channel() -> anyhow::Result<()> {
        let callable = UnaryCallable::new(|request: String, context: CallContext| async move {
            let name = context
                .channel()
                .and_then(|c| c.downcast_ref::<&str>())
                .ok_or_else(|| Error::validation("no channel bound"))?;
            Ok(format!("{request} via {name}"))
        });
        let bound = callable.bind(Channel::new("channel-7"));
        let response = bound.call("hello".to_string()).await?;
        assert_eq!(response, "hello via channel-7");
        Ok(())
    }

    #[tokio::test]
    async fn bind_keeps_existing_channel() -> anyhow::Result<()> {
        let callable = UnaryCallable::new(|_request: String, context: CallContext| async move {
            let name = context
                .channel()
                .and_then(|c| c.downcast_ref::<&str>())
                .ok_or_else(|| Error::validation("no channel bound"))?;
            Ok(name.to_string())
        });
        let bound = callable.bind(Channel::new("default"));
        let context = CallContext::new().set_channel(Channel::new("explicit"));
        let response = bound
            .call_with_context("hello".to_string(), context)
            .await?;
        assert_eq!(response, "explicit");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_uses_declared_codes() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let callable = UnaryCallable::new(move |request: String, _context: CallContext| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::rpc(Status::new(Code::Unavailable, "try again")))
                } else {
                    Ok(request.to_uppercase())
                }
            }
        });
        let callable = callable.retryable_on([Code::Unavailable]).retrying(
            RetrySettings::builder()
                .with_initial_retry_delay(Duration::from_millis(2))
                .with_max_retry_delay(Duration::from_millis(2))
                .build()?,
            Arc::new(DirectRetryingExecutor),
            Arc::new(SystemClock),
        );
        let response = callable.call("hello".to_string()).await?;
        assert_eq!(response, "HELLO");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn retrying_without_declared_codes_fails_fast() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let callable = UnaryCallable::new(move |_request: String, _context: CallContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                Err::<String, _>(Error::rpc(Status::new(Code::Unavailable, "try again")))
            }
        });
        let callable = callable.retrying(
            RetrySettings::default(),
            Arc::new(DirectRetryingExecutor),
            Arc::new(SystemClock),
        );
        let response = callable.call("hello".to_string()).await;
        assert!(
            matches!(&response, Err(e) if e.code() == Some(Code::Unavailable)),
            "{response:?}"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_propagates_attempt_timeout() -> anyhow::Result<()> {
        let callable = UnaryCallable::new(|_request: String, context: CallContext| async move {
            match context.attempt_timeout() {
                Some(timeout) => Ok(format!("{timeout:?}")),
                None => Err(Error::validation("no attempt timeout")),
            }
        });
        let callable = callable.retrying(
            RetrySettings::builder()
                .with_initial_attempt_timeout(Duration::from_secs(5))
                .build()?,
            Arc::new(DirectRetryingExecutor),
            Arc::new(SystemClock),
        );
        let response = callable.call("hello".to_string()).await?;
        assert_eq!(response, "5s");
        Ok(())
    }
}
