// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error kinds surfaced to the Connection state machine.
//!
//! Per the propagation policy, nothing below the Connection level is allowed
//! to produce a response directly; every error flows up as an [`AuroraError`]
//! and the Connection alone decides the response and the next state.

use std::io;

use crate::response::StatusCode;

/// The timeout kind that fired for a [`AuroraError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `read_deadline` fired while reading headers or body.
    Read,
    /// `write_deadline` fired while writing the response.
    Write,
    /// `keep_alive_deadline` fired while idling between requests.
    KeepAlive,
}

/// All error kinds a Connection can observe while driving a request.
#[derive(Debug, thiserror::Error)]
pub enum AuroraError {
    /// Malformed request line, headers, or framing.
    #[error("malformed request: {0}")]
    Parse(#[from] httparse::Error),

    /// Header section exceeded `max_header_bytes` before completing.
    #[error("request headers exceeded the configured limit")]
    HeaderTooLarge,

    /// Body exceeded `max_body_bytes`.
    #[error("request body exceeded the configured limit")]
    BodyTooLarge,

    /// A request declared `Transfer-Encoding: chunked`, which this tier does
    /// not support (see DESIGN.md Open Question #1).
    #[error("chunked transfer-encoding is not supported")]
    ChunkedNotSupported,

    /// One of the three Connection deadlines fired.
    #[error("{0:?} deadline exceeded")]
    Timeout(TimeoutKind),

    /// The socket returned a fatal I/O error.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    /// Admission refused the connection or request.
    #[error("server is overloaded")]
    Overloaded,

    /// No route matched the request.
    #[error("no route matched")]
    NotFound,

    /// A handler or middleware returned/panicked with an application error.
    #[error("handler failed: {0}")]
    HandlerFailure(Box<dyn std::error::Error + Send + Sync>),

    /// The buffer pool could not satisfy an allocation and the fallback
    /// allocator also failed.
    #[error("buffer pool exhausted")]
    PoolOom,
}

/// A registry mapping concrete handler/middleware error types to responses,
/// keyed by type rather than by value (spec §6 `set_exception_handler<E>`).
/// Populated pre-start; consulted by the Connection after a handler returns
/// `Err` or panics.
#[derive(Default)]
pub struct ExceptionHandlers {
    handlers: Vec<
        Box<dyn Fn(&(dyn std::error::Error + Send + Sync + 'static)) -> Option<crate::response::Response> + Send + Sync>,
    >,
}

impl ExceptionHandlers {
    /// An empty registry; every error falls through to the default mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `mapper`, invoked whenever a handler error downcasts to `E`.
    /// Earlier registrations for overlapping types take precedence.
    pub fn register<E, F>(&mut self, mapper: F)
    where
        E: std::error::Error + 'static,
        F: Fn(&E) -> crate::response::Response + Send + Sync + 'static,
    {
        self.handlers
            .push(Box::new(move |err| err.downcast_ref::<E>().map(&mapper)));
    }

    /// Maps `err` to a response via the first matching registered handler.
    pub fn map(&self, err: &(dyn std::error::Error + Send + Sync + 'static)) -> Option<crate::response::Response> {
        self.handlers.iter().find_map(|handler| handler(err))
    }
}

impl std::fmt::Debug for ExceptionHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionHandlers")
            .field("count", &self.handlers.len())
            .finish()
    }
}

impl AuroraError {
    /// The status code this error maps to when the connection has not yet
    /// written any part of a response for the current request.
    pub fn default_status(&self) -> StatusCode {
        match self {
            AuroraError::Parse(_) | AuroraError::ChunkedNotSupported => StatusCode::BadRequest,
            AuroraError::HeaderTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            AuroraError::BodyTooLarge => StatusCode::PayloadTooLarge,
            AuroraError::Timeout(TimeoutKind::Read) => StatusCode::RequestTimeout,
            AuroraError::Timeout(_) => StatusCode::InternalServerError,
            AuroraError::Io(_) => StatusCode::InternalServerError,
            AuroraError::Overloaded => StatusCode::ServiceUnavailable,
            AuroraError::NotFound => StatusCode::NotFound,
            AuroraError::HandlerFailure(_) => StatusCode::InternalServerError,
            AuroraError::PoolOom => StatusCode::ServiceUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct TeapotError;

    impl fmt::Display for TeapotError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "teapot")
        }
    }

    impl std::error::Error for TeapotError {}

    #[derive(Debug)]
    struct OtherError;

    impl fmt::Display for OtherError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "other")
        }
    }

    impl std::error::Error for OtherError {}

    #[test]
    fn registered_type_maps_to_its_response() {
        let mut handlers = ExceptionHandlers::new();
        handlers.register(|_e: &TeapotError| crate::response::Response::for_status(StatusCode::ImATeapot));

        let err: Box<dyn std::error::Error + Send + Sync> = Box::new(TeapotError);
        let mapped = handlers.map(err.as_ref()).unwrap();
        assert_eq!(mapped.status_code(), StatusCode::ImATeapot);
    }

    #[test]
    fn unregistered_type_falls_through() {
        let mut handlers = ExceptionHandlers::new();
        handlers.register(|_e: &TeapotError| crate::response::Response::for_status(StatusCode::ImATeapot));

        let err: Box<dyn std::error::Error + Send + Sync> = Box::new(OtherError);
        assert!(handlers.map(err.as_ref()).is_none());
    }
}
