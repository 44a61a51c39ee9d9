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

//! Composable middleware for unary RPC clients.
//!
//! This crate decorates a transport-supplied call primitive with the
//! client-side concerns RPC stubs share: retries with exponential backoff
//! and jitter, request batching with flow control, and page iteration. Each
//! concern is a wrapper around a [UnaryCallable][callable::UnaryCallable];
//! wrappers compose and never mutate the layer they wrap.
//!
//! The transport itself (sockets, serialization, auth) is out of scope; the
//! framework only sees a function from a request and a
//! [CallContext][callable::CallContext] to a future response.

/// An alias of [std::result::Result] where the error is always
/// [Error][crate::error::Error].
pub type Result<T> = std::result::Result<T, crate::error::Error>;

pub mod batching;
pub mod callable;
pub mod clock;
pub mod error;
pub mod paging;
pub mod retry_algorithm;
pub mod retry_settings;
pub mod retrying_executor;
pub mod retrying_future;
