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

//! Request batching: several logical requests with the same partition key
//! share one physical call.

mod batcher;
mod flow_controller;
mod options;

pub use batcher::{Batcher, BatcherFactory};
pub use flow_controller::{FlowController, Reservation};
pub use options::{BatchingSettings, FlowControlSettings, LimitExceededBehavior};

/// Requests with equal partition keys may share a physical call; requests
/// with unequal keys never do.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PartitionKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Teaches the batcher about a request/response pair.
///
/// The batcher merges the requests of a batch with [append][Self::append],
/// issues the merged request through the wrapped callable, and hands each
/// issuer its share of the response with [split_response][Self::split_response].
/// The shards are index-aligned with `counts`, which holds the
/// [element_count][Self::element_count] declared by each issuer in append
/// order.
pub trait BatchingDescriptor<Req, Resp>: Send + Sync + 'static {
    fn partition_key(&self, request: &Req) -> PartitionKey;

    /// Folds `request` into the accumulated batch request. `accumulated` is
    /// `None` for the first request of a batch.
    fn append(&self, accumulated: &mut Option<Req>, request: Req);

    /// Splits a batch response into one shard per issuer.
    fn split_response(&self, response: &Resp, counts: &[u64]) -> Vec<Resp>;

    /// The number of elements `request` contributes to a batch.
    fn element_count(&self, request: &Req) -> u64;

    /// The number of bytes `request` contributes to a batch.
    fn byte_count(&self, request: &Req) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_key() {
        let a = PartitionKey::new("tag-1");
        let b = PartitionKey::from("tag-1");
        let c = PartitionKey::from("tag-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "tag-1");
        assert_eq!(format!("{a}"), "tag-1");
        assert_eq!(PartitionKey::default().as_str(), "");
    }
}
