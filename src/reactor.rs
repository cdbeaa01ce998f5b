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

//! Thin wrapper around the platform event driver (`mio`'s epoll/kqueue/IOCP
//! abstraction), plus a single-shot timer wheel.
//!
//! The reactor is deliberately a thin boundary: every suspension in the core
//! happens by a caller observing [`IoStatus::WouldBlock`] and yielding; no
//! blocking read or write is ever issued from [`Connection`](crate::connection)
//! code. One `Reactor` lives per [`Worker`](crate::worker::Worker) and is
//! never shared across threads.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;

/// Outcome of a single non-blocking socket operation.
#[derive(Debug)]
pub enum IoStatus {
    /// `bytes` were transferred.
    Ok(usize),
    /// The socket has no more data ready (read) or buffer space (write);
    /// the caller must yield and retry once notified.
    WouldBlock,
    /// The peer closed its write half (read returned 0).
    Eof,
    /// A fatal I/O error; terminal for the connection.
    Error(io::Error),
}

/// Issues a single non-blocking read into `buf`, translating `WouldBlock`
/// and `Ok(0)` per spec §4.1.
pub fn socket_read<S: Read>(sock: &mut S, buf: &mut [u8]) -> IoStatus {
    match sock.read(buf) {
        Ok(0) if !buf.is_empty() => IoStatus::Eof,
        Ok(n) => IoStatus::Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoStatus::WouldBlock,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => IoStatus::Ok(0),
        Err(e) => IoStatus::Error(e),
    }
}

/// Issues a single non-blocking write of `slice`, translating `WouldBlock`
/// per spec §4.1.
pub fn socket_write<S: Write>(sock: &mut S, slice: &[u8]) -> IoStatus {
    match sock.write(slice) {
        Ok(n) => IoStatus::Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoStatus::WouldBlock,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => IoStatus::Ok(0),
        Err(e) => IoStatus::Error(e),
    }
}

/// Handle to a single-shot timer created via [`Reactor::create_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

/// One socket readiness event, copied out of `mio::Events` by
/// [`Reactor::poll_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// The token the readiness applies to.
    pub token: Token,
    /// Whether the socket is ready to read.
    pub readable: bool,
    /// Whether the socket is ready to write.
    pub writable: bool,
}

struct TimerSlot {
    callback: Option<Box<dyn FnMut()>>,
}

/// Wraps a per-thread `mio::Poll` plus a min-heap of armed single-shot
/// timers. Never shared across threads; `stop()` is the one operation safe
/// to call from any thread, via an `mio::Waker`.
pub struct Reactor {
    poll: Poll,
    events: Events,
    timers: Slab<TimerSlot>,
    heap: BinaryHeap<Reverse<(Instant, usize)>>,
    stopped: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
}

/// Token reserved for the reactor's own wake-up registration; never handed
/// out by [`Reactor::register_socket`].
pub const WAKE_TOKEN: Token = Token(usize::MAX);

impl Reactor {
    /// Creates a new reactor with its own `mio::Poll` instance.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Reactor {
            poll,
            events: Events::with_capacity(capacity),
            timers: Slab::new(),
            heap: BinaryHeap::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// The registry sockets must be registered against (mirrors the
    /// teacher's direct use of `poll.registry()`).
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Registers `source` for the given interest set under `token`.
    pub fn register_socket<S: mio::event::Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Updates the interest set for an already-registered socket.
    pub fn reregister_socket<S: mio::event::Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Unregisters a socket. Idempotent in the sense that a
    /// `mio`-returned error is swallowed, matching spec §4.1's
    /// `close_socket` idempotency, since the connection path may attempt
    /// this on every terminal exit (error, timeout, cancellation, panic).
    pub fn unregister_socket<S: mio::event::Source + ?Sized>(&self, source: &mut S) {
        let _ = self.poll.registry().deregister(source);
    }

    /// Arms a single-shot timer; `callback` runs on this reactor's thread
    /// from inside [`Reactor::run_once`] and must not panic (this matches
    /// the `create_timer` contract in spec §4.1 — panics inside a timer
    /// callback are not caught here and will unwind through the worker's
    /// event loop).
    pub fn create_timer(&mut self, after: Duration, callback: impl FnMut() + 'static) -> TimerId {
        let deadline = Instant::now() + after;
        let key = self.timers.insert(TimerSlot {
            callback: Some(Box::new(callback)),
        });
        self.heap.push(Reverse((deadline, key)));
        TimerId(key)
    }

    /// Cancels a timer. Idempotent and safe on an invalid or already-fired
    /// id (both simply no-op).
    pub fn cancel_timer(&mut self, id: TimerId) {
        if self.timers.contains(id.0) {
            self.timers.remove(id.0);
        }
    }

    /// A waker that can be used to unblock [`Reactor::run_once`] from any
    /// thread, including for [`Reactor::stop`].
    pub fn waker(&self) -> Arc<mio::Waker> {
        self.waker.clone()
    }

    /// Signals the reactor to stop after the current `run`/`run_once`
    /// iteration. Safe to call from any thread.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    /// Whether [`Reactor::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Runs until [`Reactor::stop`] is called, invoking `on_event` for every
    /// readiness event (other than the internal wake token) and firing due
    /// timer callbacks in between polls.
    pub fn run(&mut self, mut on_event: impl FnMut(&mio::event::Event)) -> io::Result<()> {
        while !self.is_stopped() {
            self.run_once(None, &mut on_event)?;
        }
        Ok(())
    }

    /// Polls once, blocking for at most `timeout` (or until a timer is due,
    /// whichever is sooner), firing due timers and invoking `on_event` for
    /// each socket readiness event.
    pub fn run_once(
        &mut self,
        timeout: Option<Duration>,
        mut on_event: impl FnMut(&mio::event::Event),
    ) -> io::Result<()> {
        let bound = self.next_timer_bound();
        let effective_timeout = match (timeout, bound) {
            (Some(t), Some(b)) => Some(t.min(b)),
            (Some(t), None) => Some(t),
            (None, bound) => bound,
        };

        self.poll.poll(&mut self.events, effective_timeout)?;

        for event in self.events.iter() {
            if event.token() != WAKE_TOKEN {
                on_event(event);
            }
        }

        self.fire_due_timers_inner();
        Ok(())
    }

    /// Polls once and returns the ready events as an owned `Vec`, rather than
    /// invoking a live callback during the poll. [`Worker`](crate::worker::Worker)
    /// needs this lower-level split: its dispatch touches the `Reactor`
    /// itself (registering/reregistering sockets, arming timers), which
    /// [`Reactor::run_once`]'s callback cannot do without re-borrowing the
    /// `&mut self` its own poll call already holds. Returning an owned `Vec`
    /// ends that borrow before dispatch runs, exactly the way the teacher's
    /// `MultiListener::run` copies `Events` out of `Poll::poll` before
    /// iterating it.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let bound = self.next_timer_bound();
        let effective_timeout = match (timeout, bound) {
            (Some(t), Some(b)) => Some(t.min(b)),
            (Some(t), None) => Some(t),
            (None, bound) => bound,
        };

        self.poll.poll(&mut self.events, effective_timeout)?;

        Ok(self
            .events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(|event| ReadyEvent {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
            })
            .collect())
    }

    /// Fires every timer callback whose deadline has passed. Public so
    /// `Worker` can invoke it directly after [`Reactor::poll_once`] rather
    /// than going through [`Reactor::run_once`].
    pub fn fire_due_timers(&mut self) {
        self.fire_due_timers_inner();
    }

    fn next_timer_bound(&self) -> Option<Duration> {
        self.heap.peek().map(|Reverse((deadline, _))| {
            deadline.saturating_duration_since(Instant::now())
        })
    }

    fn fire_due_timers_inner(&mut self) {
        let now = Instant::now();
        while let Some(&Reverse((deadline, key))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();

            if let Some(slot) = self.timers.try_remove(key) {
                if let Some(mut callback) = slot.callback {
                    callback();
                }
            }
        }
    }
}
