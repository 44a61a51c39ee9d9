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

/// Options for batching behavior.
///
/// A batch is sent when any threshold is crossed: it accumulated at least
/// [element_count_threshold][Self::element_count_threshold] elements, at
/// least [request_byte_threshold][Self::request_byte_threshold] bytes, or it
/// has been open for [delay_threshold][Self::delay_threshold].
///
/// ```
/// # use unary_callable::batching::BatchingSettings;
/// let settings = BatchingSettings::new()
///     .set_element_count_threshold(10_u64)
///     .set_delay_threshold(std::time::Duration::from_millis(5));
/// assert_eq!(settings.element_count_threshold(), 10);
/// ```
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct BatchingSettings {
    element_count_threshold: u64,
    request_byte_threshold: u64,
    delay_threshold: Duration,
    enabled: bool,
    flow_control: Option<FlowControlSettings>,
}

impl BatchingSettings {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch is sent once it holds at least this many elements. Clamped
    /// to a minimum of 1.
    pub fn set_element_count_threshold<V: Into<u64>>(mut self, v: V) -> Self {
        self.element_count_threshold = v.into().max(1);
        self
    }

    pub fn element_count_threshold(&self) -> u64 {
        self.element_count_threshold
    }

    /// A batch is sent once it holds at least this many bytes. Clamped to a
    /// minimum of 1.
    pub fn set_request_byte_threshold<V: Into<u64>>(mut self, v: V) -> Self {
        self.request_byte_threshold = v.into().max(1);
        self
    }

    pub fn request_byte_threshold(&self) -> u64 {
        self.request_byte_threshold
    }

    /// A batch is sent this long after it opened, even if no other
    /// threshold was crossed.
    pub fn set_delay_threshold<V: Into<Duration>>(mut self, v: V) -> Self {
        self.delay_threshold = v.into();
        self
    }

    pub fn delay_threshold(&self) -> Duration {
        self.delay_threshold
    }

    /// With batching disabled every request passes through unchanged and
    /// the descriptor is never consulted.
    pub fn set_enabled(mut self, v: bool) -> Self {
        self.enabled = v;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_flow_control(mut self, v: FlowControlSettings) -> Self {
        self.flow_control = Some(v);
        self
    }

    pub fn flow_control(&self) -> Option<&FlowControlSettings> {
        self.flow_control.as_ref()
    }
}

impl std::default::Default for BatchingSettings {
    fn default() -> Self {
        Self {
            element_count_threshold: 100,
            request_byte_threshold: 1000,
            delay_threshold: Duration::from_millis(10),
            enabled: true,
            flow_control: None,
        }
    }
}

/// What happens to a reservation that does not fit under the configured
/// limits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LimitExceededBehavior {
    /// The reservation waits until outstanding work releases capacity.
    #[default]
    Block,
    /// The reservation fails immediately with
    /// [Error::flow_controlled][crate::error::Error::flow_controlled].
    ThrowException,
}

/// Limits on the work outstanding behind a
/// [FlowController][super::FlowController].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct FlowControlSettings {
    max_outstanding_element_count: u32,
    max_outstanding_request_bytes: u32,
    limit_exceeded_behavior: LimitExceededBehavior,
}

impl FlowControlSettings {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamped to a minimum of 1.
    pub fn set_max_outstanding_element_count<V: Into<u32>>(mut self, v: V) -> Self {
        self.max_outstanding_element_count = v.into().max(1);
        self
    }

    pub fn max_outstanding_element_count(&self) -> u32 {
        self.max_outstanding_element_count
    }

    /// Clamped to a minimum of 1.
    pub fn set_max_outstanding_request_bytes<V: Into<u32>>(mut self, v: V) -> Self {
        self.max_outstanding_request_bytes = v.into().max(1);
        self
    }

    pub fn max_outstanding_request_bytes(&self) -> u32 {
        self.max_outstanding_request_bytes
    }

    pub fn set_limit_exceeded_behavior(mut self, v: LimitExceededBehavior) -> Self {
        self.limit_exceeded_behavior = v;
        self
    }

    pub fn limit_exceeded_behavior(&self) -> LimitExceededBehavior {
        self.limit_exceeded_behavior
    }
}

impl std::default::Default for FlowControlSettings {
    fn default() -> Self {
        Self {
            max_outstanding_element_count: 10_000,
            max_outstanding_request_bytes: 100 * 1024 * 1024,
            limit_exceeded_behavior: LimitExceededBehavior::default(),
        }
    }
}
