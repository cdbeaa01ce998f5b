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

//! Thread owning one [`Reactor`], one [`BufferPool`], one [`Arena`], and a
//! share of the accept load (spec §4.8).
//!
//! A Worker never shares its `Slab<Connection>`, `Reactor`, `BufferPool`, or
//! `Arena` with another thread; the only things it shares are the read-mostly
//! `Router`/`Pipeline`/`ExceptionHandlers`/`ServerConfig` and the atomic
//! `Metrics`/`Admission`, all behind `Arc`. It owns its own clone of the
//! listening socket (see `examples/ryanseipp-rask-old/examples/example_server.rs`'s shared-listener
//! pattern) rather than receiving accepted sockets over a channel, so there
//! is no cross-thread handoff and no lock on any hot path (spec §5).

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mio::{Interest, Token};
use slab::Slab;

use crate::admission::{Admission, Xorshift64};
use crate::arena::Arena;
use crate::buffer::pool::BufferPool;
use crate::config::{OverloadBehavior, ServerConfig};
use crate::connection::{Connection, Outcome, PendingTimeouts, Services};
use crate::error::{ExceptionHandlers, TimeoutKind};
use crate::metrics::Metrics;
use crate::middleware::Pipeline;
use crate::reactor::{ReadyEvent, Reactor};
use crate::response::{Response, StatusCode};
use crate::router::Router;

/// Token reserved for the shared listening socket; distinct from
/// [`crate::reactor::WAKE_TOKEN`], which the Reactor itself reserves.
const LISTEN_TOKEN: Token = Token(usize::MAX - 1);

/// Size of the per-request scratch arena. Not named as a tunable in spec §6;
/// chosen generously enough for typical handler scratch allocations without
/// the Worker ever needing to grow it (Arenas don't grow, see spec §4.3).
const ARENA_CAPACITY_BYTES: usize = 64 * 1024;

/// One worker thread's private runtime: a Reactor, buffer pool, arena, RNG,
/// connection table, and its own clone of the listening socket.
pub struct Worker {
    id: usize,
    listener: mio::net::TcpListener,
    reactor: Reactor,
    pool: BufferPool,
    arena: Arena,
    rng: Xorshift64,
    connections: Slab<Connection>,
    pending_timeouts: PendingTimeouts,
    date: String,
    date_tick: Rc<RefCell<bool>>,
    shutdown_deadline: Option<std::time::Instant>,

    router: Arc<Router>,
    pipeline: Arc<Pipeline>,
    exception_handlers: Arc<ExceptionHandlers>,
    config: Arc<ServerConfig>,
    metrics: Arc<Metrics>,
    admission: Arc<Admission>,
}

impl Worker {
    /// Builds a Worker over its own clone of the listening socket, registering
    /// it under [`LISTEN_TOKEN`] and arming the first `Date` refresh timer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        mut listener: mio::net::TcpListener,
        router: Arc<Router>,
        pipeline: Arc<Pipeline>,
        exception_handlers: Arc<ExceptionHandlers>,
        config: Arc<ServerConfig>,
        metrics: Arc<Metrics>,
        admission: Arc<Admission>,
    ) -> io::Result<Self> {
        let reactor = Reactor::new(1024)?;
        reactor.register_socket(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x2545_F491_4F6C_DD1D)
            ^ (id as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);

        let mut worker = Worker {
            id,
            listener,
            reactor,
            pool: BufferPool::new(),
            arena: Arena::new(ARENA_CAPACITY_BYTES),
            rng: Xorshift64::new(seed),
            connections: Slab::new(),
            pending_timeouts: Rc::new(RefCell::new(Vec::new())),
            date: format_http_date(SystemTime::now()),
            date_tick: Rc::new(RefCell::new(false)),
            shutdown_deadline: None,
            router,
            pipeline,
            exception_handlers,
            config,
            metrics,
            admission,
        };
        worker.arm_date_timer();
        Ok(worker)
    }

    /// This worker's id, used only for diagnostics (`Connection::worker_id`
    /// and log fields); never used to route work, since a Connection is
    /// never migrated across Workers (spec §5).
    pub fn id(&self) -> usize {
        self.id
    }

    /// A waker that can stop this worker's Reactor from another thread. The
    /// `Server` collects every Worker's waker before handing the Worker off
    /// to its own thread.
    pub fn waker(&self) -> Arc<mio::Waker> {
        self.reactor.waker()
    }

    /// Runs until the Reactor is stopped (via a waker from another thread
    /// calling [`crate::reactor::Reactor::stop`]).
    pub fn run(mut self) {
        while !self.reactor.is_stopped() {
            if let Err(err) = self.poll_and_dispatch() {
                tracing::error!(worker_id = self.id, error = %err, "worker poll failed");
                break;
            }
        }
    }

    fn poll_and_dispatch(&mut self) -> io::Result<()> {
        let ready = self.reactor.poll_once(None)?;
        for event in ready {
            if event.token == LISTEN_TOKEN {
                self.accept();
            } else {
                self.dispatch(event);
            }
        }
        self.reactor.fire_due_timers();
        self.drain_pending_timeouts();
        self.refresh_date_if_due();
        self.advance_shutdown();
        Ok(())
    }

    /// Drives graceful shutdown once [`Admission::begin_shutdown`] has been
    /// called elsewhere (spec §4.9). `Admission::allow_accept` already
    /// refuses new connections once `shutting_down` is set, so this only
    /// needs to wait out in-flight work: force-close whatever is left once
    /// either every Connection has finished on its own, or `grace_period`
    /// elapses, then stop this Worker's Reactor so [`Worker::run`] returns.
    fn advance_shutdown(&mut self) {
        if !self.admission.is_shutting_down() {
            return;
        }
        let deadline = *self
            .shutdown_deadline
            .get_or_insert_with(|| std::time::Instant::now() + self.config.grace_period);

        if self.connections.is_empty() || std::time::Instant::now() >= deadline {
            self.connections.clear();
            self.reactor.stop();
        }
    }

    /// Drains the accept queue (spec §4.8 "dequeue an incoming socket"),
    /// gating each new connection through [`Admission::allow_accept`]
    /// (spec §4.10 hysteresis). Grounded in the teacher's
    /// `MultiListener::accept`.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    let _ = stream.set_nodelay(true);

                    if !self.admission.allow_accept() {
                        self.metrics.record_rejected();
                        reject_connection(stream, &self.config);
                        continue;
                    }

                    let entry = self.connections.vacant_entry();
                    let token = Token(entry.key());
                    let mut connection = Connection::new(token, stream, self.id);

                    let mut services = build_services(
                        &mut self.reactor,
                        &mut self.pool,
                        &mut self.arena,
                        &mut self.rng,
                        &self.router,
                        &self.pipeline,
                        &self.exception_handlers,
                        &self.config,
                        &self.metrics,
                        &self.admission,
                        &self.date,
                        self.pending_timeouts.clone(),
                    );
                    if connection.begin(&mut services).is_ok() {
                        self.metrics.record_accepted();
                        entry.insert(connection);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::warn!(worker_id = self.id, error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    /// Dispatches one socket readiness event to the matching Connection
    /// (spec §4.4 via the teacher's `MultiListener::event`/`close_connection`
    /// idempotency pattern).
    fn dispatch(&mut self, event: ReadyEvent) {
        let mut outcome = Outcome::Continue;

        if event.readable {
            let mut services = build_services(
                &mut self.reactor,
                &mut self.pool,
                &mut self.arena,
                &mut self.rng,
                &self.router,
                &self.pipeline,
                &self.exception_handlers,
                &self.config,
                &self.metrics,
                &self.admission,
                &self.date,
                self.pending_timeouts.clone(),
            );
            match self.connections.get_mut(event.token.0) {
                Some(conn) => outcome = conn.on_readable(&mut services),
                None => return,
            }
        }

        if outcome != Outcome::Closed && event.writable {
            let mut services = build_services(
                &mut self.reactor,
                &mut self.pool,
                &mut self.arena,
                &mut self.rng,
                &self.router,
                &self.pipeline,
                &self.exception_handlers,
                &self.config,
                &self.metrics,
                &self.admission,
                &self.date,
                self.pending_timeouts.clone(),
            );
            match self.connections.get_mut(event.token.0) {
                Some(conn) => outcome = conn.on_writable(&mut services),
                None => return,
            }
        }

        if outcome == Outcome::Closed {
            self.connections.remove(event.token.0);
        }
    }

    /// Delivers every `(Token, TimeoutKind)` a Reactor timer callback queued
    /// this iteration (see [`PendingTimeouts`]'s doc comment).
    fn drain_pending_timeouts(&mut self) {
        let fired: Vec<(Token, TimeoutKind)> = self.pending_timeouts.borrow_mut().drain(..).collect();
        for (token, kind) in fired {
            let mut services = build_services(
                &mut self.reactor,
                &mut self.pool,
                &mut self.arena,
                &mut self.rng,
                &self.router,
                &self.pipeline,
                &self.exception_handlers,
                &self.config,
                &self.metrics,
                &self.admission,
                &self.date,
                self.pending_timeouts.clone(),
            );
            let outcome = match self.connections.get_mut(token.0) {
                Some(conn) => conn.on_timeout(kind, &mut services),
                None => continue,
            };
            if outcome == Outcome::Closed {
                self.connections.remove(token.0);
            }
        }
    }

    /// Arms the next one-second `Date` refresh (spec §C.1). A single-shot
    /// timer re-armed on every firing, rather than a recurring timer — the
    /// Reactor only offers single-shot timers (see `reactor.rs`'s
    /// `create_timer`), the same reasoning `Connection`'s own deadlines
    /// follow.
    fn arm_date_timer(&mut self) {
        let tick = self.date_tick.clone();
        self.reactor.create_timer(Duration::from_secs(1), move || {
            *tick.borrow_mut() = true;
        });
    }

    fn refresh_date_if_due(&mut self) {
        let due = std::mem::replace(&mut *self.date_tick.borrow_mut(), false);
        if due {
            self.date = format_http_date(SystemTime::now());
            self.arm_date_timer();
        }
    }
}

/// Builds the per-event [`Services`] bundle from the Worker's own disjoint
/// fields. A free function taking each field individually — rather than a
/// `&mut self` method — so the borrow checker sees these as separate field
/// borrows and callers can still reach `self.connections` afterward; the
/// same reasoning behind `connection.rs`'s free-standing `build_response`.
#[allow(clippy::too_many_arguments)]
fn build_services<'a>(
    reactor: &'a mut Reactor,
    pool: &'a mut BufferPool,
    arena: &'a mut Arena,
    rng: &'a mut Xorshift64,
    router: &'a Router,
    pipeline: &'a Pipeline,
    exception_handlers: &'a ExceptionHandlers,
    config: &'a ServerConfig,
    metrics: &'a Metrics,
    admission: &'a Admission,
    date: &'a str,
    pending_timeouts: PendingTimeouts,
) -> Services<'a> {
    Services {
        reactor,
        pool,
        arena,
        rng,
        router,
        pipeline,
        exception_handlers,
        config,
        metrics,
        admission,
        date,
        pending_timeouts,
    }
}

/// Best-effort handling for a socket accepted while [`Admission::allow_accept`]
/// refuses it: either a synthetic `503` (with `Retry-After`) or a bare close.
/// `OverloadBehavior::Rst` here means an immediate close without a response —
/// mio's `TcpStream` exposes no `SO_LINGER` control, so this cannot force an
/// OS-level RST without an extra socket crate; an unacknowledged close is the
/// closest equivalent available from this stack, a deliberate simplification
/// rather than a silently-dropped behavior.
fn reject_connection(mut stream: mio::net::TcpStream, config: &ServerConfig) {
    use std::io::Write;

    if config.overload_behavior == OverloadBehavior::Reject503 {
        let mut response = Response::for_status(StatusCode::ServiceUnavailable);
        response.header("Retry-After", config.retry_after_seconds.to_string());
        let mut out = Vec::new();
        response.serialize_into(&mut out, &format_http_date(SystemTime::now()), true);
        let _ = stream.write_all(&out);
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Formats `now` as an RFC 7231 IMF-fixdate (`Tue, 15 Nov 1994 08:12:31 GMT`),
/// the `Date` header's wire format. No date/time crate is pulled in for a
/// single UTC-from-epoch calendar conversion (spec §C.1); `civil_from_days`
/// is Howard Hinnant's well-known proleptic-Gregorian day-count conversion.
fn format_http_date(now: SystemTime) -> String {
    let secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let days = (secs / 86_400) as i64;
    let time_of_day = secs % 86_400;
    let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);
    // 1970-01-01 (day 0) was a Thursday, index 3 in `WEEKDAYS`.
    let weekday = WEEKDAYS[(days.rem_euclid(7) + 3) as usize % 7];
    let (year, month, day) = civil_from_days(days);
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        weekday,
        day,
        MONTHS[(month - 1) as usize],
        year,
        hour,
        minute,
        second
    )
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    fn test_worker(router: Router) -> Worker {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let listener = mio::net::TcpListener::from_std(std_listener);
        let config = Arc::new(ServerConfig::default());
        let metrics = Arc::new(Metrics::new());
        let admission = Arc::new(Admission::new(config.clone(), metrics.clone()));
        Worker::new(
            0,
            listener,
            Arc::new(router),
            Arc::new(Pipeline::new()),
            Arc::new(ExceptionHandlers::new()),
            config,
            metrics,
            admission,
        )
        .unwrap()
    }

    #[test]
    fn format_http_date_matches_known_instant() {
        // 2024-01-01T00:00:00Z, a Monday.
        let formatted = format_http_date(UNIX_EPOCH + Duration::from_secs(1_704_067_200));
        assert_eq!(formatted, "Mon, 01 Jan 2024 00:00:00 GMT");
    }

    #[test]
    fn accept_registers_and_serves_a_connection() {
        let mut router = Router::new();
        router
            .register(crate::request::Method::Get, "/ping", |ctx: &mut Context<'_>| {
                ctx.response().send(b"pong".to_vec());
                Ok(())
            })
            .unwrap();

        let mut worker = test_worker(router);
        let addr = worker.listener.local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .write_all(b"GET /ping HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        for _ in 0..30 {
            worker.poll_and_dispatch().unwrap();
        }

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("pong"));
    }

    #[test]
    fn overloaded_accept_gets_503_and_is_not_tracked() {
        let mut worker = test_worker(Router::new());
        let mut config = (*worker.config).clone();
        config.connection_high_water = 0.0;
        config.max_connections = 1;
        worker.config = Arc::new(config);
        worker.admission = Arc::new(Admission::new(worker.config.clone(), worker.metrics.clone()));
        worker.metrics.record_accepted();

        let addr = worker.listener.local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();

        worker.poll_and_dispatch().unwrap();

        assert!(worker.connections.is_empty());
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 503"));
    }
}
