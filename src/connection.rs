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

//! The per-socket state machine: spec §4.4, the heart of the core.
//!
//! A [`Connection`] owns exactly one accepted socket and walks it through
//! `NEW -> READING_HEADERS -> [READING_BODY] -> PROCESSING ->
//! WRITING_RESPONSE -> (KEEP_ALIVE -> READING_HEADERS | CLOSING)`. It never
//! blocks: every socket operation goes through [`crate::reactor::socket_read`]
//! / [`crate::reactor::socket_write`] and yields on `WouldBlock`. It never
//! touches another Connection or another Worker's state directly; everything
//! it needs from the outside is borrowed transiently through [`Services`].

use std::cell::RefCell;
use std::error::Error as StdError;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::admission::{Admission, Xorshift64};
use crate::arena::Arena;
use crate::buffer::pool::BufferPool;
use crate::buffer::{Buffer, BucketSize};
use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::{ExceptionHandlers, TimeoutKind};
use crate::metrics::Metrics;
use crate::middleware::Pipeline;
use crate::reactor::{socket_read, socket_write, IoStatus, Reactor, TimerId};
use crate::request::{self, ParseOutcome, RequestView};
use crate::response::{Response, StatusCode};
use crate::router::Router;

/// A `(Token, TimeoutKind)` pair pushed by a [`Reactor`] timer callback,
/// drained by the owning [`Worker`](crate::worker::Worker) after each
/// `run_once`. A timer callback given to [`Reactor::create_timer`] cannot
/// reach back into `Worker`/`Connection` state directly without becoming a
/// self-referential closure, so it pushes here instead — the same design
/// already noted on `Reactor` itself.
pub type PendingTimeouts = Rc<RefCell<Vec<(Token, TimeoutKind)>>>;

/// Every stage of spec §4.4's state diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, not yet registered with the reactor.
    New,
    /// Reading and parsing the request line and headers.
    ReadingHeaders,
    /// Headers are complete; waiting for a declared body to arrive.
    ReadingBody,
    /// Routing and running the middleware/handler pipeline.
    Processing,
    /// Writing the serialized response.
    WritingResponse,
    /// Idle between requests on a keep-alive connection.
    KeepAlive,
    /// Tearing down; terminal aside from [`ConnectionState::Closed`].
    Closing,
    /// Fully torn down. A closed Connection is removed from the Worker's
    /// slab on the next opportunity.
    Closed,
}

/// Everything a [`Connection`] borrows from its owning
/// [`Worker`](crate::worker::Worker) for the duration of one reactor event.
/// Constructed fresh per event from the Worker's own disjoint fields; never
/// stored on `Connection` itself.
pub struct Services<'a> {
    /// This worker's reactor, for (re)registration and timers.
    pub reactor: &'a mut Reactor,
    /// This worker's buffer pool.
    pub pool: &'a mut BufferPool,
    /// This worker's per-request scratch arena.
    pub arena: &'a mut Arena,
    /// This worker's shed-ratio PRNG.
    pub rng: &'a mut Xorshift64,
    /// The immutable, shared route table.
    pub router: &'a Router,
    /// The shared middleware pipeline.
    pub pipeline: &'a Pipeline,
    /// The shared exception-handler registry.
    pub exception_handlers: &'a ExceptionHandlers,
    /// The shared server configuration.
    pub config: &'a ServerConfig,
    /// The shared metrics handle.
    pub metrics: &'a Metrics,
    /// The shared admission/health state.
    pub admission: &'a Admission,
    /// The worker's cached `Date` header value (refreshed on a timer; see
    /// SPEC_FULL.md §C.1).
    pub date: &'a str,
    /// Cross-thread-free queue timer callbacks report firings into.
    pub pending_timeouts: PendingTimeouts,
}

/// What the Worker should do with a Connection after handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep the connection registered; its interest set may have changed.
    Continue,
    /// The connection reached `CLOSED`; remove it from the slab.
    Closed,
}

/// One accepted, non-blocking socket driven through spec §4.4's states.
pub struct Connection {
    token: Token,
    stream: TcpStream,
    #[allow(dead_code)]
    worker_id: usize,
    state: ConnectionState,

    read_buf: Option<Buffer>,
    read_pos: usize,

    write_buf: Vec<u8>,
    write_pos: usize,
    pending_keep_alive: bool,

    keep_alive_count: u32,
    response_started: bool,
    processing_started: Option<Instant>,
    last_status_code: u16,

    read_timer: Option<TimerId>,
    write_timer: Option<TimerId>,
    keep_alive_timer: Option<TimerId>,

    /// Reused across requests on this connection via [`Response::reset`]
    /// rather than a fresh [`Response::new`] per request.
    response: Response,
}

impl Connection {
    /// Wraps a freshly-accepted, non-blocking socket. Does not register it
    /// with the reactor yet; call [`Connection::begin`] to do so.
    pub fn new(token: Token, stream: TcpStream, worker_id: usize) -> Self {
        Connection {
            token,
            stream,
            worker_id,
            state: ConnectionState::New,
            read_buf: None,
            read_pos: 0,
            write_buf: Vec::new(),
            write_pos: 0,
            pending_keep_alive: false,
            keep_alive_count: 0,
            response_started: false,
            processing_started: None,
            last_status_code: 0,
            read_timer: None,
            write_timer: None,
            keep_alive_timer: None,
            response: Response::new(),
        }
    }

    /// This connection's reactor token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Whether this connection has reached `CLOSED`.
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// The interest set this connection currently needs, or `None` while it
    /// has nothing registerable (new/closing/closed).
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnectionState::New | ConnectionState::Closing | ConnectionState::Closed => None,
            ConnectionState::ReadingHeaders
            | ConnectionState::ReadingBody
            | ConnectionState::KeepAlive
            | ConnectionState::Processing => Some(Interest::READABLE),
            ConnectionState::WritingResponse => Some(Interest::WRITABLE),
        }
    }

    /// Registers the socket with the reactor and transitions into
    /// `READING_HEADERS` (spec §4.4 step 1).
    pub fn begin(&mut self, services: &mut Services<'_>) -> io::Result<()> {
        services
            .reactor
            .register_socket(&mut self.stream, self.token, Interest::READABLE)?;
        self.start_reading_headers(services);
        Ok(())
    }

    fn start_reading_headers(&mut self, services: &mut Services<'_>) {
        self.state = ConnectionState::ReadingHeaders;
        self.read_pos = 0;
        self.response_started = false;
        if self.read_buf.is_none() {
            self.read_buf = Some(services.pool.acquire(BucketSize::Tiny.capacity()));
        }
        self.arm_read_deadline(services);
    }

    /// Drives the reactor's `READABLE` readiness for this connection: reads
    /// whatever bytes are available, advances parsing, and (once a complete
    /// request arrives) runs the pipeline and begins writing the response.
    pub fn on_readable(&mut self, services: &mut Services<'_>) -> Outcome {
        if self.state == ConnectionState::KeepAlive {
            self.cancel_keep_alive_timer(services);
            self.start_reading_headers(services);
        }

        if !matches!(
            self.state,
            ConnectionState::ReadingHeaders | ConnectionState::ReadingBody
        ) {
            return self.current_outcome();
        }

        loop {
            if !self.ensure_read_capacity(services) {
                self.begin_closing(services);
                return Outcome::Closed;
            }

            let read_pos = self.read_pos;
            let buf = self.read_buf.as_mut().expect("reading state implies a loaned buffer");
            match socket_read(&mut self.stream, &mut buf[read_pos..]) {
                IoStatus::Ok(0) => continue,
                IoStatus::Ok(n) => {
                    self.read_pos += n;
                    if self.advance_parse(services) {
                        return self.current_outcome();
                    }
                }
                IoStatus::WouldBlock => return self.current_outcome(),
                IoStatus::Eof => {
                    self.begin_closing(services);
                    return Outcome::Closed;
                }
                IoStatus::Error(_) => {
                    self.begin_closing(services);
                    return Outcome::Closed;
                }
            }
        }
    }

    /// Returns `true` once parsing has either completed (and `process` has
    /// been run) or failed (and a response/close has already been issued) —
    /// in both cases the caller's read loop must stop.
    fn advance_parse(&mut self, services: &mut Services<'_>) -> bool {
        let buf: &[u8] = &self.read_buf.as_ref().expect("read buffer loaned while reading")[..self.read_pos];
        match RequestView::parse(buf) {
            Ok(ParseOutcome::Complete(_)) => {
                self.cancel_read_timer(services);
                self.state = ConnectionState::Processing;
                self.process(services);
                true
            }
            Ok(ParseOutcome::Partial) => {
                if request::headers_complete(buf) {
                    self.state = ConnectionState::ReadingBody;
                    match request::declared_content_length(buf) {
                        Ok(Some(len)) if len > services.config.max_body_bytes => {
                            self.respond_and_close(services, StatusCode::PayloadTooLarge);
                            true
                        }
                        Ok(_) => false,
                        Err(e) => {
                            let status = e.default_status();
                            self.respond_and_close(services, status);
                            true
                        }
                    }
                } else if self.read_pos >= services.config.max_header_bytes {
                    self.respond_and_close(services, StatusCode::RequestHeaderFieldsTooLarge);
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                let status = e.default_status();
                self.respond_and_close(services, status);
                true
            }
        }
    }

    fn ensure_read_capacity(&mut self, services: &mut Services<'_>) -> bool {
        let cap = self.read_buf.as_ref().map(Buffer::capacity).unwrap_or(0);
        if self.read_pos < cap {
            return true;
        }
        let ceiling = services.config.max_header_bytes.max(services.config.max_body_bytes) + BucketSize::Tiny.capacity();
        let needed = (cap * 2).max(BucketSize::Small.capacity()).min(ceiling.max(cap + 1));
        if needed <= cap {
            // The oversize guards in `advance_parse` will reject this
            // connection before the buffer's capacity could matter further.
            return true;
        }
        let mut new_buf = services.pool.acquire(needed);
        if let Some(old) = self.read_buf.take() {
            new_buf[..self.read_pos].copy_from_slice(&old[..self.read_pos]);
            services.pool.release(old);
        }
        self.read_buf = Some(new_buf);
        true
    }

    /// Runs routing, middleware, and the matched handler once a full request
    /// has been parsed (spec §4.4 steps 5-7), then begins writing the
    /// response.
    fn process(&mut self, services: &mut Services<'_>) {
        self.processing_started = Some(Instant::now());
        let buf: &[u8] = &self.read_buf.as_ref().expect("processing holds the loaned read buffer")[..self.read_pos];
        let view = match RequestView::parse(buf) {
            Ok(ParseOutcome::Complete(view)) => view,
            _ => unreachable!("process is only entered once advance_parse observed a complete parse"),
        };

        let client_wants_keep_alive = view.should_keep_alive();
        build_response(&view, services, &mut self.response);
        self.finalize_response(services, client_wants_keep_alive);
    }

    fn finalize_response(&mut self, services: &mut Services<'_>, client_wants_keep_alive: bool) {
        self.keep_alive_count += 1;
        let will_keep_alive = client_wants_keep_alive
            && !self.response.close_requested()
            && self.keep_alive_count <= services.config.max_requests_per_connection
            && !services.admission.is_shutting_down()
            && services.admission.allow_accept();

        let elapsed = self
            .processing_started
            .take()
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.last_status_code = self.response.status_code().code();
        services.metrics.record_request(self.last_status_code, elapsed);

        let mut out = std::mem::take(&mut self.write_buf);
        out.clear();
        self.response.serialize_into(&mut out, services.date, !will_keep_alive);
        self.write_buf = out;
        self.write_pos = 0;
        self.pending_keep_alive = will_keep_alive;
        self.response_started = true;

        self.state = ConnectionState::WritingResponse;
        let _ = services
            .reactor
            .reregister_socket(&mut self.stream, self.token, Interest::WRITABLE);
        self.arm_write_deadline(services);
        self.try_write(services);
    }

    /// Drives the reactor's `WRITABLE` readiness for this connection.
    pub fn on_writable(&mut self, services: &mut Services<'_>) -> Outcome {
        if self.state != ConnectionState::WritingResponse {
            return self.current_outcome();
        }
        self.try_write(services);
        self.current_outcome()
    }

    fn try_write(&mut self, services: &mut Services<'_>) {
        while self.write_pos < self.write_buf.len() {
            match socket_write(&mut self.stream, &self.write_buf[self.write_pos..]) {
                IoStatus::Ok(0) => continue,
                IoStatus::Ok(n) => self.write_pos += n,
                IoStatus::WouldBlock => return,
                IoStatus::Eof | IoStatus::Error(_) => {
                    self.begin_closing(services);
                    return;
                }
            }
        }
        self.complete_write(services);
    }

    fn complete_write(&mut self, services: &mut Services<'_>) {
        self.cancel_write_timer(services);
        if self.pending_keep_alive {
            services.metrics.record_keep_alive();
            self.reset_for_keep_alive(services);
        } else {
            self.begin_closing(services);
        }
    }

    fn reset_for_keep_alive(&mut self, services: &mut Services<'_>) {
        self.state = ConnectionState::KeepAlive;
        let _ = services
            .reactor
            .reregister_socket(&mut self.stream, self.token, Interest::READABLE);
        self.write_buf.clear();
        self.write_pos = 0;
        self.read_pos = 0;
        self.response_started = false;
        services.arena.reset();
        if let Some(buf) = self.read_buf.take() {
            services.pool.release(buf);
        }
        self.arm_keep_alive_deadline(services);
    }

    /// Reacts to a fired `read`/`write`/`keep_alive` deadline (spec §4.4
    /// step 3/8/"idle" and §4.9 timeouts). A stale firing — the connection
    /// already moved past the state the timer was armed for — is a no-op.
    pub fn on_timeout(&mut self, kind: TimeoutKind, services: &mut Services<'_>) -> Outcome {
        match kind {
            TimeoutKind::Read => {
                if matches!(self.state, ConnectionState::ReadingHeaders | ConnectionState::ReadingBody) {
                    if self.response_started {
                        self.begin_closing(services);
                    } else {
                        self.respond_and_close(services, StatusCode::RequestTimeout);
                    }
                }
            }
            TimeoutKind::Write => {
                if self.state == ConnectionState::WritingResponse {
                    self.begin_closing(services);
                }
            }
            TimeoutKind::KeepAlive => {
                if self.state == ConnectionState::KeepAlive {
                    self.begin_closing(services);
                }
            }
        }
        self.current_outcome()
    }

    /// Synthesizes a response with no body beyond the status line (used for
    /// oversize/parse-error/timeout paths that never reach a handler), writes
    /// it, and closes the connection once the write completes.
    fn respond_and_close(&mut self, services: &mut Services<'_>, status: StatusCode) {
        self.cancel_read_timer(services);
        self.response.reset();
        self.response.status(status);
        self.finalize_response(services, false);
    }

    /// Idempotent teardown (spec §4.4 `CLOSING`): cancels every timer,
    /// unregisters the socket, releases the read buffer, shuts the socket
    /// down, and records the connection as closed.
    fn begin_closing(&mut self, services: &mut Services<'_>) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Closing;
        self.cancel_all_timers(services);
        services.reactor.unregister_socket(&mut self.stream);
        if let Some(buf) = self.read_buf.take() {
            services.pool.release(buf);
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        services.metrics.record_connection_closed();
        self.state = ConnectionState::Closed;
    }

    fn current_outcome(&self) -> Outcome {
        if self.is_closed() {
            Outcome::Closed
        } else {
            Outcome::Continue
        }
    }

    fn arm_timer(&self, services: &mut Services<'_>, after: Duration, kind: TimeoutKind) -> TimerId {
        let token = self.token;
        let pending = services.pending_timeouts.clone();
        services.reactor.create_timer(after, move || {
            pending.borrow_mut().push((token, kind));
        })
    }

    fn arm_read_deadline(&mut self, services: &mut Services<'_>) {
        self.cancel_read_timer(services);
        self.read_timer = Some(self.arm_timer(services, services.config.read_deadline, TimeoutKind::Read));
    }

    fn arm_write_deadline(&mut self, services: &mut Services<'_>) {
        self.cancel_write_timer(services);
        self.write_timer = Some(self.arm_timer(services, services.config.write_deadline, TimeoutKind::Write));
    }

    fn arm_keep_alive_deadline(&mut self, services: &mut Services<'_>) {
        self.cancel_keep_alive_timer(services);
        self.keep_alive_timer = Some(self.arm_timer(services, services.config.keep_alive_deadline, TimeoutKind::KeepAlive));
    }

    fn cancel_read_timer(&mut self, services: &mut Services<'_>) {
        if let Some(id) = self.read_timer.take() {
            services.reactor.cancel_timer(id);
        }
    }

    fn cancel_write_timer(&mut self, services: &mut Services<'_>) {
        if let Some(id) = self.write_timer.take() {
            services.reactor.cancel_timer(id);
        }
    }

    fn cancel_keep_alive_timer(&mut self, services: &mut Services<'_>) {
        if let Some(id) = self.keep_alive_timer.take() {
            services.reactor.cancel_timer(id);
        }
    }

    fn cancel_all_timers(&mut self, services: &mut Services<'_>) {
        self.cancel_read_timer(services);
        self.cancel_write_timer(services);
        self.cancel_keep_alive_timer(services);
    }
}

/// Runs admission checks, routing, and the middleware/handler pipeline for
/// one fully-parsed request, writing the outcome into `response`. A free
/// function (rather than a `Connection` method) so its only borrow of
/// `Services` is the mutable one it actually needs, independent of whatever
/// borrow of `Connection::read_buf` the caller is holding to produce `view`.
/// `response` is reset here rather than replaced, so a keep-alive connection
/// reuses its one `Response`'s header/body allocations across requests.
fn build_response(view: &RequestView<'_>, services: &mut Services<'_>, response: &mut Response) {
    response.reset();

    if let Some(health) = health_response(view.path(), services) {
        *response = health;
        return;
    }

    if !services.admission.allow_in_flight() {
        services.metrics.record_rejected();
        *response = overloaded_response(services);
        return;
    }

    let path = view.path();
    if services.admission.should_shed(path, services.rng.next_f64()) {
        services.metrics.record_rejected();
        *response = overloaded_response(services);
        return;
    }

    services.metrics.record_in_flight_start();

    let matched = services.router.matches(view.method(), path);
    let outcome: Result<Result<(), Box<dyn StdError + Send + Sync>>, Box<dyn std::any::Any + Send>> = match matched {
        Some((handler, params)) => {
            let mut ctx = Context::new(view, response, params, &mut *services.arena);
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| services.pipeline.run(&mut ctx, handler)))
        }
        None => {
            response.status(StatusCode::NotFound);
            Ok(Ok(()))
        }
    };

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            *response = services
                .exception_handlers
                .map(err.as_ref())
                .unwrap_or_else(|| Response::for_status(StatusCode::InternalServerError));
        }
        Err(_panic) => {
            tracing::error!(path, "handler panicked while processing request");
            *response = Response::for_status(StatusCode::InternalServerError);
        }
    }

    services.metrics.record_in_flight_end();
}

/// Answers a configured health-check path directly (spec §4.10), bypassing
/// admission checks and routing entirely: a probe's purpose is to report
/// `Admission`'s own state, so it must not be shed, rejected by the in-flight
/// cap, or depend on any route being registered.
fn health_response(path: &str, services: &Services<'_>) -> Option<Response> {
    let health_paths = &services.config.health_paths;
    let up = if path == health_paths.liveness {
        services.admission.liveness()
    } else if path == health_paths.readiness {
        services.admission.readiness()
    } else if path == health_paths.startup {
        services.admission.startup()
    } else {
        return None;
    };

    let status = if up { StatusCode::Ok } else { StatusCode::ServiceUnavailable };
    Some(Response::for_status(status))
}

fn overloaded_response(services: &Services<'_>) -> Response {
    let mut response = Response::for_status(StatusCode::ServiceUnavailable);
    response.header("Retry-After", services.config.retry_after_seconds.to_string());
    response.request_close();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use std::io::{Read, Write};
    use std::net::TcpListener as StdTcpListener;
    use std::rc::Rc;

    fn accept_pair() -> (std::net::TcpStream, TcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server))
    }

    struct Harness {
        reactor: Reactor,
        pool: BufferPool,
        arena: Arena,
        rng: Xorshift64,
        router: Router,
        pipeline: Pipeline,
        exception_handlers: ExceptionHandlers,
        config: ServerConfig,
        metrics: std::sync::Arc<Metrics>,
        admission: Admission,
        pending_timeouts: PendingTimeouts,
    }

    impl Harness {
        fn new(router: Router) -> Self {
            let config = ServerConfig::default();
            let metrics = std::sync::Arc::new(Metrics::new());
            let admission = Admission::new(std::sync::Arc::new(config.clone()), metrics.clone());
            Harness {
                reactor: Reactor::new(16).unwrap(),
                pool: BufferPool::new(),
                arena: Arena::new(4096),
                rng: Xorshift64::new(42),
                router,
                pipeline: Pipeline::new(),
                exception_handlers: ExceptionHandlers::new(),
                config,
                metrics,
                admission,
                pending_timeouts: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn services(&mut self) -> Services<'_> {
            Services {
                reactor: &mut self.reactor,
                pool: &mut self.pool,
                arena: &mut self.arena,
                rng: &mut self.rng,
                router: &self.router,
                pipeline: &self.pipeline,
                exception_handlers: &self.exception_handlers,
                config: &self.config,
                metrics: &self.metrics,
                admission: &self.admission,
                date: "Mon, 01 Jan 2024 00:00:00 GMT",
                pending_timeouts: self.pending_timeouts.clone(),
            }
        }
    }

    #[test]
    fn round_trips_a_simple_get() {
        let mut router = Router::new();
        router
            .register(crate::request::Method::Get, "/hello", |ctx: &mut Context<'_>| {
                ctx.response().send(b"hi".to_vec());
                Ok(())
            })
            .unwrap();

        let mut harness = Harness::new(router);
        let (mut client, server_stream) = accept_pair();
        let mut conn = Connection::new(Token(1), server_stream, 0);

        {
            let mut services = harness.services();
            conn.begin(&mut services).unwrap();
        }

        client.write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").unwrap();

        for _ in 0..10 {
            let mut services = harness.services();
            let outcome = conn.on_readable(&mut services);
            if outcome == Outcome::Closed {
                break;
            }
            if conn.state == ConnectionState::WritingResponse {
                conn.try_write(&mut services);
            }
        }

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hi"));
    }

    #[test]
    fn no_matching_route_returns_404() {
        let router = Router::new();
        let mut harness = Harness::new(router);
        let (mut client, server_stream) = accept_pair();
        let mut conn = Connection::new(Token(1), server_stream, 0);

        {
            let mut services = harness.services();
            conn.begin(&mut services).unwrap();
        }
        client
            .write_all(b"GET /missing HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        for _ in 0..10 {
            let mut services = harness.services();
            conn.on_readable(&mut services);
            if conn.state == ConnectionState::Closed {
                break;
            }
        }

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn interest_tracks_state() {
        let router = Router::new();
        let mut harness = Harness::new(router);
        let (_client, server_stream) = accept_pair();
        let mut conn = Connection::new(Token(1), server_stream, 0);
        assert_eq!(conn.interest(), None);
        let mut services = harness.services();
        conn.begin(&mut services).unwrap();
        assert_eq!(conn.interest(), Some(Interest::READABLE));
    }

    #[test]
    fn oversize_headers_are_rejected_with_431() {
        let router = Router::new();
        let mut harness = Harness::new(router);
        harness.config.max_header_bytes = 16;
        let (mut client, server_stream) = accept_pair();
        let mut conn = Connection::new(Token(1), server_stream, 0);
        {
            let mut services = harness.services();
            conn.begin(&mut services).unwrap();
        }
        client
            .write_all(b"GET /this/path/is/long/enough/to/exceed HTTP/1.1\r\n\r\n")
            .unwrap();

        for _ in 0..10 {
            let mut services = harness.services();
            conn.on_readable(&mut services);
            if conn.state == ConnectionState::Closed {
                break;
            }
        }

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 431"));
    }

    #[test]
    fn health_path_answers_without_a_registered_route() {
        let router = Router::new();
        let mut harness = Harness::new(router);
        harness.admission.mark_ready();
        let (mut client, server_stream) = accept_pair();
        let mut conn = Connection::new(Token(1), server_stream, 0);
        {
            let mut services = harness.services();
            conn.begin(&mut services).unwrap();
        }
        client
            .write_all(b"GET /health/ready HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        for _ in 0..10 {
            let mut services = harness.services();
            conn.on_readable(&mut services);
            if conn.state == ConnectionState::Closed {
                break;
            }
        }

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn health_readiness_is_503_before_server_is_marked_ready() {
        let router = Router::new();
        let mut harness = Harness::new(router);
        let (mut client, server_stream) = accept_pair();
        let mut conn = Connection::new(Token(1), server_stream, 0);
        {
            let mut services = harness.services();
            conn.begin(&mut services).unwrap();
        }
        client
            .write_all(b"GET /health/ready HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        for _ in 0..10 {
            let mut services = harness.services();
            conn.on_readable(&mut services);
            if conn.state == ConnectionState::Closed {
                break;
            }
        }

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 503"));
    }

    #[test]
    fn begin_closing_is_idempotent() {
        let router = Router::new();
        let mut harness = Harness::new(router);
        let (_client, server_stream) = accept_pair();
        let mut conn = Connection::new(Token(1), server_stream, 0);
        let mut services = harness.services();
        conn.begin(&mut services).unwrap();
        conn.begin_closing(&mut services);
        conn.begin_closing(&mut services);
        assert!(conn.is_closed());
    }
}
