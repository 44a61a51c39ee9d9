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

//! The errors produced while composing and executing unary calls.

use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The canonical RPC status codes used to classify attempt failures.
///
/// Retry decisions compare a failed attempt's code against the set of codes
/// the application declared as retryable. The framework attaches no inherent
/// meaning to any code beyond that comparison, with one exception:
/// [DeadlineExceeded][Code::DeadlineExceeded] marks attempts that consumed
/// their full time budget, and such attempts (when retryable) are retried
/// without any backoff sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        write!(f, "{name}")
    }
}

/// The classified outcome of a failed attempt, as reported by the transport.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new<M: Into<String>>(code: Code, message: M) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// The core error type for this crate.
///
/// All the operations in this crate, including attempts issued through a
/// [UnaryCallable][crate::callable::UnaryCallable], return this error type.
/// Applications should rarely need to create them, except in tests and in
/// transport adaptors. Use the constructors to create errors, the predicates
/// to tell the terminal conditions apart, and [code()][Error::code] to
/// recover the transport classification.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<BoxError>,
}

#[derive(Clone, Debug)]
enum ErrorKind {
    /// An attempt failed with a transport-classified status.
    Rpc(Status),
    /// An attempt timeout or the total call budget expired.
    Timeout,
    /// The configured attempt count was consumed without success.
    Exhausted,
    /// The caller misused an API surface, e.g. a fixed-size collection that
    /// cannot be satisfied, or a batch response with the wrong shard count.
    Validation(String),
    /// The call was cancelled before it completed.
    Cancelled,
    /// A flow-control reservation was rejected under the fail-fast policy.
    FlowControl,
}

impl Error {
    /// A failed attempt classified by the transport.
    pub fn rpc(status: Status) -> Self {
        Self {
            kind: ErrorKind::Rpc(status),
            source: None,
        }
    }

    /// The attempt timeout, or the total time budget for the call, expired.
    pub fn timeout<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            source: Some(source.into()),
        }
    }

    /// The maximum number of attempts was reached. Wraps the last attempt
    /// error.
    pub fn exhausted<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Exhausted,
            source: Some(source.into()),
        }
    }

    /// A precondition on the requested operation does not hold.
    pub fn validation<M: Into<String>>(message: M) -> Self {
        Self {
            kind: ErrorKind::Validation(message.into()),
            source: None,
        }
    }

    /// The call was cancelled.
    pub fn cancelled<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            source: Some(source.into()),
        }
    }

    /// A flow-control reservation failed under
    /// [ThrowException][crate::batching::LimitExceededBehavior::ThrowException].
    pub fn flow_controlled<T: Into<BoxError>>(source: T) -> Self {
        Self {
            kind: ErrorKind::FlowControl,
            source: Some(source.into()),
        }
    }

    /// Creates a new error with the same classification as `source`.
    ///
    /// Used when one physical failure must be delivered to several waiters,
    /// e.g. every issuer of a failed batch. The waiters observe the same
    /// [code()][Error::code] the original failure carried, and share the
    /// original as their source.
    pub(crate) fn shared(source: Arc<Error>) -> Self {
        Self {
            kind: source.kind.clone(),
            source: Some(Box::new(source)),
        }
    }

    /// The transport classification, if this error carries one.
    ///
    /// Client-side timeouts classify as [Code::DeadlineExceeded] so that a
    /// retry policy treats a locally-enforced attempt timeout and a
    /// server-reported one identically.
    pub fn code(&self) -> Option<Code> {
        match &self.kind {
            ErrorKind::Rpc(status) => Some(status.code),
            ErrorKind::Timeout => Some(Code::DeadlineExceeded),
            _ => None,
        }
    }

    /// The full status for transport-classified failures.
    pub fn status(&self) -> Option<&Status> {
        match &self.kind {
            ErrorKind::Rpc(status) => Some(status),
            _ => None,
        }
    }

    /// The attempt timeout or total time budget was exceeded.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// The maximum number of attempts was reached.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.kind, ErrorKind::Exhausted)
    }

    /// A precondition on the requested operation failed.
    pub fn is_validation(&self) -> bool {
        matches!(self.kind, ErrorKind::Validation(_))
    }

    /// The call was cancelled before completing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// A flow-control reservation was rejected.
    pub fn is_flow_controlled(&self) -> bool {
        matches!(self.kind, ErrorKind::FlowControl)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ErrorKind::Rpc(status) => write!(f, "the attempt failed with {status}"),
            ErrorKind::Timeout => write!(f, "the time budget for the call was exceeded"),
            ErrorKind::Exhausted => write!(f, "the maximum number of attempts was exhausted"),
            ErrorKind::Validation(msg) => write!(f, "a precondition failed: {msg}"),
            ErrorKind::Cancelled => write!(f, "the call was cancelled"),
            ErrorKind::FlowControl => write!(f, "a flow-control reservation was rejected"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}
