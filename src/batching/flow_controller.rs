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
use crate::batching::options::{FlowControlSettings, LimitExceededBehavior};
use crate::error::Error;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the elements and bytes admitted into batching but not yet
/// completed by a physical call.
///
/// A [reservation][FlowController::reserve] is taken before a request is
/// enqueued and released (by dropping the [Reservation]) only after the
/// physical call carrying it completes. Under
/// [Block][LimitExceededBehavior::Block] a reservation that does not fit
/// waits; under [ThrowException][LimitExceededBehavior::ThrowException] it
/// fails immediately. A single request larger than a configured bound is
/// clamped to that bound, so it is admitted (alone) rather than deadlocked
/// or rejected outright.
#[derive(Debug)]
pub struct FlowController {
    behavior: LimitExceededBehavior,
    max_elements: u32,
    max_bytes: u32,
    elements: Arc<Semaphore>,
    bytes: Arc<Semaphore>,
}

/// Holds flow-control capacity until dropped.
#[derive(Debug)]
pub struct Reservation {
    _elements: OwnedSemaphorePermit,
    _bytes: OwnedSemaphorePermit,
}

impl FlowController {
    pub fn new(settings: FlowControlSettings) -> Self {
        let max_elements = settings.max_outstanding_element_count();
        let max_bytes = settings.max_outstanding_request_bytes();
        Self {
            behavior: settings.limit_exceeded_behavior(),
            max_elements,
            max_bytes,
            elements: Arc::new(Semaphore::new(max_elements as usize)),
            bytes: Arc::new(Semaphore::new(max_bytes as usize)),
        }
    }

    /// Reserves capacity for one request. Acquisition order is elements
    /// then bytes, always, so concurrent reservations cannot deadlock.
    pub async fn reserve(&self, elements: u64, bytes: u64) -> Result<Reservation> {
        let elements = clamp(elements, self.max_elements);
        let bytes = clamp(bytes, self.max_bytes);
        match self.behavior {
            LimitExceededBehavior::Block => {
                let e = self
                    .elements
                    .clone()
                    .acquire_many_owned(elements)
                    .await
                    .map_err(Error::cancelled)?;
                let b = self
                    .bytes
                    .clone()
                    .acquire_many_owned(bytes)
                    .await
                    .map_err(Error::cancelled)?;
                Ok(Reservation {
                    _elements: e,
                    _bytes: b,
                })
            }
            LimitExceededBehavior::ThrowException => {
                let e = self
                    .elements
                    .clone()
                    .try_acquire_many_owned(elements)
                    .map_err(|_| {
                        Error::flow_controlled(format!(
                            "cannot reserve {elements} elements, the outstanding limit is {}",
                            self.max_elements
                        ))
                    })?;
                let b = self
                    .bytes
                    .clone()
                    .try_acquire_many_owned(bytes)
                    .map_err(|_| {
                        Error::flow_controlled(format!(
                            "cannot reserve {bytes} bytes, the outstanding limit is {}",
                            self.max_bytes
                        ))
                    })?;
                Ok(Reservation {
                    _elements: e,
                    _bytes: b,
                })
            }
        }
    }

    /// The elements currently reserved and not yet released.
    pub fn outstanding_elements(&self) -> u32 {
        self.max_elements - self.elements.available_permits() as u32
    }

    /// The bytes currently reserved and not yet released.
    pub fn outstanding_bytes(&self) -> u32 {
        self.max_bytes - self.bytes.available_permits() as u32
    }
}

fn clamp(requested: u64, maximum: u32) -> u32 {
    requested.min(maximum as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(elements: u32, bytes: u32, behavior: LimitExceededBehavior) -> FlowControlSettings {
        FlowControlSettings::new()
            .set_max_outstanding_element_count(elements)
            .set_max_outstanding_request_bytes(bytes)
            .set_limit_exceeded_behavior(behavior)
    }

    #[tokio::test]
    async fn reserve_and_release() -> anyhow::Result<()> {
        let controller = FlowController::new(settings(10, 100, LimitExceededBehavior::Block));
        let reservation = controller.reserve(4, 40).await?;
        assert_eq!(controller.outstanding_elements(), 4);
        assert_eq!(controller.outstanding_bytes(), 40);
        let other = controller.reserve(6, 60).await?;
        assert_eq!(controller.outstanding_elements(), 10);
        assert_eq!(controller.outstanding_bytes(), 100);

        drop(reservation);
        assert_eq!(controller.outstanding_elements(), 6);
        assert_eq!(controller.outstanding_bytes(), 60);
        drop(other);
        assert_eq!(controller.outstanding_elements(), 0);
        assert_eq!(controller.outstanding_bytes(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn block_waits_for_capacity() -> anyhow::Result<()> {
        let controller =
            Arc::new(FlowController::new(settings(4, 100, LimitExceededBehavior::Block)));
        let first = controller.reserve(3, 10).await?;

        // Does not fit; the reservation must park instead of failing.
        let blocked = tokio::time::timeout(Duration::from_millis(50), controller.reserve(2, 10));
        assert!(blocked.await.is_err());

        drop(first);
        let second = tokio::time::timeout(Duration::from_millis(50), controller.reserve(2, 10))
            .await
            .expect("capacity was released")?;
        assert_eq!(controller.outstanding_elements(), 2);
        drop(second);
        Ok(())
    }

    #[tokio::test]
    async fn throw_exception_fails_fast() -> anyhow::Result<()> {
        let controller =
            FlowController::new(settings(4, 100, LimitExceededBehavior::ThrowException));
        let first = controller.reserve(3, 10).await?;
        let result = controller.reserve(2, 10).await;
        assert!(
            matches!(&result, Err(e) if e.is_flow_controlled()),
            "{result:?}"
        );
        // The failed reservation must not leak element permits.
        drop(first);
        assert_eq!(controller.outstanding_elements(), 0);
        assert_eq!(controller.outstanding_bytes(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_requests_are_clamped() -> anyhow::Result<()> {
        let controller = FlowController::new(settings(4, 8, LimitExceededBehavior::Block));
        let reservation = controller.reserve(100, 1000).await?;
        assert_eq!(controller.outstanding_elements(), 4);
        assert_eq!(controller.outstanding_bytes(), 8);
        drop(reservation);
        assert_eq!(controller.outstanding_elements(), 0);
        Ok(())
    }
}
