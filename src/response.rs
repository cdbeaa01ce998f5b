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

//! Response builder: mutable status/headers/body assembled by handlers and
//! middleware, serialized by the Connection once `WRITING_RESPONSE` begins.

use std::fmt;

/// HTTP status codes this tier needs. Handlers may still set an arbitrary
/// numeric code via [`Response::status_raw`] for codes not named here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200
    Ok,
    /// 204
    NoContent,
    /// 400
    BadRequest,
    /// 404
    NotFound,
    /// 408
    RequestTimeout,
    /// 413
    PayloadTooLarge,
    /// 418
    ImATeapot,
    /// 431
    RequestHeaderFieldsTooLarge,
    /// 500
    InternalServerError,
    /// 503
    ServiceUnavailable,
    /// Any other status, carried verbatim with a caller-supplied reason.
    Other(u16, &'static str),
}

impl StatusCode {
    /// The numeric status code.
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::NoContent => 204,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::RequestTimeout => 408,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::ImATeapot => 418,
            StatusCode::RequestHeaderFieldsTooLarge => 431,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::Other(code, _) => code,
        }
    }

    /// The standard reason phrase.
    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::NoContent => "No Content",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::ImATeapot => "I'm a teapot",
            StatusCode::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::Other(_, reason) => reason,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// A single response header, insertion order preserved.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    /// Header name, sent verbatim.
    pub name: String,
    /// Header value, sent verbatim.
    pub value: String,
}

/// Mutable response under construction by the route handler and middleware.
///
/// Header insertion order is preserved; inserting a header with the same
/// name (case-insensitively) a second time overrides the earlier value in
/// place, matching spec §3's "later overrides earlier" rule, rather than
/// appending a duplicate.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Vec<ResponseHeader>,
    body: Vec<u8>,
    close_requested: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// A fresh 200 OK response with no headers or body.
    pub fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Vec::new(),
            body: Vec::new(),
            close_requested: false,
        }
    }

    /// Sets the status code.
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Current status code.
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Inserts or overrides a header (case-insensitive name match).
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(&name))
        {
            Some(existing) => existing.value = value,
            None => self.headers.push(ResponseHeader { name, value }),
        }
        self
    }

    /// Looks up a header by case-insensitive name.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Sets the response body, replacing any previous body.
    pub fn send(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// Sets the body to `json` and the `Content-Type` header accordingly.
    /// Accepts already-serialized JSON bytes; Aurora's core does not depend
    /// on a JSON crate (serialization is an application concern).
    pub fn json(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.header("Content-Type", "application/json");
        self.send(body)
    }

    /// Requests that the connection close after this response instead of
    /// considering keep-alive.
    pub fn request_close(&mut self) -> &mut Self {
        self.close_requested = true;
        self
    }

    /// Whether this response asked for the connection to close.
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Resets this response to a fresh state for keep-alive reuse, avoiding
    /// a fresh heap allocation for `headers`/`body` where capacity allows.
    pub fn reset(&mut self) {
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.body.clear();
        self.close_requested = false;
    }

    /// Serializes the status line, headers, and body into `out`, adding
    /// `Content-Length`, `Date`, and `Server` headers if not already present,
    /// and `Connection: close` when `force_close` is set.
    pub fn serialize_into(&self, out: &mut Vec<u8>, date: &str, force_close: bool) {
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.code().to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.reason().as_bytes());
        out.extend_from_slice(b"\r\n");

        for header in &self.headers {
            write_header(out, &header.name, &header.value);
        }

        if self.get_header("Content-Length").is_none() {
            write_header(out, "Content-Length", &self.body.len().to_string());
        }
        if self.get_header("Date").is_none() {
            write_header(out, "Date", date);
        }
        if self.get_header("Server").is_none() {
            write_header(out, "Server", concat!("Aurora/", env!("CARGO_PKG_VERSION")));
        }
        if force_close && self.get_header("Connection").is_none() {
            write_header(out, "Connection", "close");
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
    }

    /// Builds a short-circuit response carrying only a status code and an
    /// optional `Retry-After` header, used by the admission layer and error
    /// paths that never reach a handler.
    pub fn for_status(status: StatusCode) -> Self {
        let mut response = Self::new();
        response.status(status);
        response
    }
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_override_preserves_position() {
        let mut response = Response::new();
        response.header("X-A", "1");
        response.header("X-B", "2");
        response.header("X-A", "3");
        assert_eq!(response.get_header("X-A"), Some("3"));
        assert_eq!(response.headers.len(), 2);
        assert_eq!(response.headers[0].value, "3");
    }

    #[test]
    fn serialize_includes_mandatory_headers() {
        let mut response = Response::new();
        response.send(b"hi".to_vec());
        let mut out = Vec::new();
        response.serialize_into(&mut out, "Mon, 01 Jan 2024 00:00:00 GMT", false);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Date: Mon, 01 Jan 2024 00:00:00 GMT\r\n"));
        assert!(text.contains("Server: Aurora/"));
        assert!(text.ends_with("hi"));
    }

    #[test]
    fn force_close_adds_connection_header() {
        let response = Response::new();
        let mut out = Vec::new();
        response.serialize_into(&mut out, "date", true);
        assert!(String::from_utf8(out).unwrap().contains("Connection: close\r\n"));
    }
}
