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

//! Zero-copy request view over a `httparse`-parsed request.
//!
//! [`RequestView`] never owns the bytes it describes; every accessor is a
//! slice into the Connection's read buffer. It must not outlive the buffer
//! and must not be held across a buffer mutation (the Connection's
//! processing step parses once, uses the view for routing/dispatch, then
//! drops it before the next read).

use std::fmt;

/// Maximum headers `httparse` will parse in one call. 64 comfortably covers
/// real-world requests without an unbounded allocation.
const MAX_HEADERS: usize = 64;

/// HTTP methods recognized by Aurora's router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.4 (patch is defined in RFC 5789)
    Patch,
    /// RFC 9110 9.3.5
    Delete,
    /// RFC 9110 9.3.6
    Connect,
    /// RFC 9110 9.3.7
    Options,
    /// RFC 9110 9.3.8
    Trace,
}

impl Method {
    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            _ => return None,
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        })
    }
}

/// Outcome of attempting to parse the bytes accumulated so far.
pub enum ParseOutcome<'buf> {
    /// Headers (and body, if any) are fully available.
    Complete(RequestView<'buf>),
    /// More bytes are needed before a request can be produced.
    Partial,
}

/// A single request header (name borrowed, value borrowed as raw bytes since
/// header values are not guaranteed valid UTF-8).
#[derive(Debug, Clone, Copy)]
pub struct Header<'buf> {
    /// Header name.
    pub name: &'buf str,
    /// Header value, raw bytes.
    pub value: &'buf [u8],
}

/// Immutable, zero-copy view of a fully-received HTTP/1.1 request.
#[derive(Debug)]
pub struct RequestView<'buf> {
    method: Method,
    target: &'buf str,
    path: &'buf str,
    query: Option<&'buf str>,
    minor_version: u8,
    headers: Vec<Header<'buf>>,
    body: &'buf [u8],
}

impl<'buf> RequestView<'buf> {
    /// Attempts to parse a complete request out of `buf`. Returns
    /// [`ParseOutcome::Partial`] if more bytes are required, or an error if
    /// the bytes received so far are structurally invalid.
    pub fn parse(buf: &'buf [u8]) -> Result<ParseOutcome<'buf>, crate::error::AuroraError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut raw_request = httparse::Request::new(&mut raw_headers);

        let header_len = match raw_request.parse(buf)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Ok(ParseOutcome::Partial),
        };

        let method_str = raw_request.method.expect("complete parse sets method");
        let method = Method::from_str(method_str).ok_or_else(|| {
            crate::error::AuroraError::Parse(httparse::Error::Token)
        })?;
        let target = raw_request.path.expect("complete parse sets path");
        let (path, query) = match target.find('?') {
            Some(idx) => (&target[..idx], Some(&target[idx + 1..])),
            None => (target, None),
        };
        let minor_version = raw_request.version.expect("complete parse sets version");

        let headers: Vec<Header<'buf>> = raw_request
            .headers
            .iter()
            .map(|h| Header {
                name: h.name,
                value: h.value,
            })
            .collect();

        if headers
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
        {
            return Err(crate::error::AuroraError::ChunkedNotSupported);
        }

        let content_length = content_length(&headers)?;
        let available_body = &buf[header_len..];

        let body = match content_length {
            Some(len) => {
                if available_body.len() < len {
                    return Ok(ParseOutcome::Partial);
                }
                &available_body[..len]
            }
            None => &[],
        };

        Ok(ParseOutcome::Complete(RequestView {
            method,
            target,
            path,
            query,
            minor_version,
            headers,
            body,
        }))
    }

    /// The request method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The raw request-target, e.g. `/users/42?active=true`.
    pub fn target(&self) -> &'buf str {
        self.target
    }

    /// The path component only, without the query string.
    pub fn path(&self) -> &'buf str {
        self.path
    }

    /// The raw query string, if present, without the leading `?`.
    pub fn query(&self) -> Option<&'buf str> {
        self.query
    }

    /// Case-insensitive header lookup; returns the first match in document
    /// order.
    pub fn header(&self, name: &str) -> Option<&'buf [u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
    }

    /// Case-insensitive header lookup decoded as UTF-8; returns `None` if the
    /// header is absent or not valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&'buf str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All headers, in document order.
    pub fn headers(&self) -> &[Header<'buf>] {
        &self.headers
    }

    /// The request body, or an empty slice if none was declared.
    pub fn body(&self) -> &'buf [u8] {
        self.body
    }

    /// Whether the client asked to keep the connection alive, per HTTP/1.1
    /// semantics: keep-alive is the default for HTTP/1.1 unless
    /// `Connection: close` is present; for HTTP/1.0 the default is close
    /// unless `Connection: keep-alive` is present.
    pub fn should_keep_alive(&self) -> bool {
        let connection = self.header_str("Connection").unwrap_or("");
        let tokens = || connection.split(',').map(|t| t.trim());
        if self.minor_version >= 1 {
            !tokens().any(|t| t.eq_ignore_ascii_case("close"))
        } else {
            tokens().any(|t| t.eq_ignore_ascii_case("keep-alive"))
        }
    }
}

/// Cheap standalone check for whether the header section of `buf` is
/// structurally complete (the `\r\n\r\n` terminator has been found),
/// independent of whether the body (if any) has fully arrived.
///
/// [`RequestView::parse`] returns [`ParseOutcome::Partial`] for both "still
/// reading headers" and "headers done, body pending" — the Connection needs
/// this finer distinction to apply `max_header_bytes` only while headers
/// themselves are incomplete (spec §4.4 step 3).
pub fn headers_complete(buf: &[u8]) -> bool {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw_request = httparse::Request::new(&mut raw_headers);
    matches!(raw_request.parse(buf), Ok(httparse::Status::Complete(_)))
}

/// Re-parses just enough of `buf` to read the declared `Content-Length`,
/// once headers are known complete. `httparse` is stateless per call, so
/// re-invoking it against the growing read buffer is the same cost model
/// [`RequestView::parse`] already pays.
pub fn declared_content_length(buf: &[u8]) -> Result<Option<usize>, crate::error::AuroraError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw_request = httparse::Request::new(&mut raw_headers);
    match raw_request.parse(buf)? {
        httparse::Status::Complete(_) => {
            let headers: Vec<Header<'_>> = raw_request
                .headers
                .iter()
                .map(|h| Header { name: h.name, value: h.value })
                .collect();
            if headers.iter().any(|h| h.name.eq_ignore_ascii_case("transfer-encoding")) {
                return Err(crate::error::AuroraError::ChunkedNotSupported);
            }
            content_length(&headers)
        }
        httparse::Status::Partial => Ok(None),
    }
}

fn content_length(headers: &[Header<'_>]) -> Result<Option<usize>, crate::error::AuroraError> {
    let Some(raw) = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .map(|h| h.value)
    else {
        return Ok(None);
    };

    let text =
        std::str::from_utf8(raw).map_err(|_| crate::error::AuroraError::Parse(httparse::Error::HeaderValue))?;
    text.trim()
        .parse::<usize>()
        .map(Some)
        .map_err(|_| crate::error::AuroraError::Parse(httparse::Error::HeaderValue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let buf = b"GET /users/42?active=true HTTP/1.1\r\nHost: x\r\n\r\n";
        match RequestView::parse(buf).unwrap() {
            ParseOutcome::Complete(view) => {
                assert_eq!(view.method(), Method::Get);
                assert_eq!(view.path(), "/users/42");
                assert_eq!(view.query(), Some("active=true"));
                assert!(view.should_keep_alive());
                assert_eq!(view.body(), b"");
            }
            ParseOutcome::Partial => panic!("expected complete parse"),
        }
    }

    #[test]
    fn partial_when_body_not_fully_received() {
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(
            RequestView::parse(buf).unwrap(),
            ParseOutcome::Partial
        ));
    }

    #[test]
    fn complete_once_body_arrives() {
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        match RequestView::parse(buf).unwrap() {
            ParseOutcome::Complete(view) => assert_eq!(view.body(), b"abc"),
            ParseOutcome::Partial => panic!("expected complete parse"),
        }
    }

    #[test]
    fn connection_close_overrides_http11_default() {
        let buf = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        match RequestView::parse(buf).unwrap() {
            ParseOutcome::Complete(view) => assert!(!view.should_keep_alive()),
            ParseOutcome::Partial => panic!("expected complete parse"),
        }
    }

    #[test]
    fn http10_defaults_to_close() {
        let buf = b"GET / HTTP/1.0\r\n\r\n";
        match RequestView::parse(buf).unwrap() {
            ParseOutcome::Complete(view) => assert!(!view.should_keep_alive()),
            ParseOutcome::Partial => panic!("expected complete parse"),
        }
    }

    #[test]
    fn headers_complete_detects_terminator() {
        assert!(!headers_complete(b"GET / HTTP/1.1\r\nHost: x\r\n"));
        assert!(headers_complete(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
    }

    #[test]
    fn declared_content_length_reads_before_body_arrives() {
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(declared_content_length(buf).unwrap(), Some(10));
    }

    #[test]
    fn chunked_transfer_encoding_is_rejected() {
        let buf = b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(matches!(
            RequestView::parse(buf),
            Err(crate::error::AuroraError::ChunkedNotSupported)
        ));
    }
}
