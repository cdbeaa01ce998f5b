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

//! Observable counters named in spec §6. No exporter is bundled (out of
//! scope per spec §1) — these are plain atomics an embedder can read from a
//! shared [`Metrics`] handle and publish however it likes.

use std::sync::atomic::{AtomicU64, Ordering};

const LOAD: Ordering = Ordering::Relaxed;

/// A small fixed set of latency buckets (seconds), upper-bound inclusive,
/// good enough for a histogram without pulling in a metrics crate.
pub const DURATION_BUCKETS_SECONDS: [f64; 8] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Process-wide, lock-free counters. Cheap to clone (an `Arc` internally via
/// [`Metrics::handle`]); every field is an independent atomic so there is no
/// cross-counter consistency guarantee, matching spec §5's "no locks on any
/// hot path".
#[derive(Debug, Default)]
pub struct Metrics {
    accepted_total: AtomicU64,
    rejected_total: AtomicU64,
    current_connections: AtomicU64,
    current_in_flight: AtomicU64,
    requests_total: [AtomicU64; 6],
    duration_buckets: [AtomicU64; DURATION_BUCKETS_SECONDS.len() + 1],
    connections_keep_alive: AtomicU64,
}

/// Status class used to label `requests_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 1xx
    Informational,
    /// 2xx
    Success,
    /// 3xx
    Redirect,
    /// 4xx
    ClientError,
    /// 5xx
    ServerError,
    /// Anything outside 100-599.
    Other,
}

impl StatusClass {
    fn index(self) -> usize {
        match self {
            StatusClass::Informational => 0,
            StatusClass::Success => 1,
            StatusClass::Redirect => 2,
            StatusClass::ClientError => 3,
            StatusClass::ServerError => 4,
            StatusClass::Other => 5,
        }
    }

    /// Classifies a numeric HTTP status code.
    pub fn from_code(code: u16) -> Self {
        match code {
            100..=199 => StatusClass::Informational,
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirect,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Other,
        }
    }
}

impl Metrics {
    /// A fresh, zeroed set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful `accept()`.
    pub fn record_accepted(&self) {
        self.accepted_total.fetch_add(1, LOAD);
        self.current_connections.fetch_add(1, LOAD);
    }

    /// Records admission refusing a connection or request.
    pub fn record_rejected(&self) {
        self.rejected_total.fetch_add(1, LOAD);
    }

    /// Records a Connection reaching `CLOSED`.
    pub fn record_connection_closed(&self) {
        self.current_connections.fetch_sub(1, LOAD);
    }

    /// Records a request entering `PROCESSING`.
    pub fn record_in_flight_start(&self) {
        self.current_in_flight.fetch_add(1, LOAD);
    }

    /// Records a request leaving `PROCESSING` (response written or aborted).
    pub fn record_in_flight_end(&self) {
        self.current_in_flight.fetch_sub(1, LOAD);
    }

    /// Records a completed request/response cycle and its wall-clock
    /// duration.
    pub fn record_request(&self, status_code: u16, duration_seconds: f64) {
        self.requests_total[StatusClass::from_code(status_code).index()].fetch_add(1, LOAD);
        let bucket = DURATION_BUCKETS_SECONDS
            .iter()
            .position(|&upper| duration_seconds <= upper)
            .unwrap_or(DURATION_BUCKETS_SECONDS.len());
        self.duration_buckets[bucket].fetch_add(1, LOAD);
    }

    /// Records a connection continuing via keep-alive rather than closing.
    pub fn record_keep_alive(&self) {
        self.connections_keep_alive.fetch_add(1, LOAD);
    }

    /// Total accepted connections since start.
    pub fn accepted_total(&self) -> u64 {
        self.accepted_total.load(LOAD)
    }

    /// Total rejected connections/requests since start.
    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(LOAD)
    }

    /// Connections currently open.
    pub fn current_connections(&self) -> u64 {
        self.current_connections.load(LOAD)
    }

    /// Requests currently in `PROCESSING`.
    pub fn current_in_flight(&self) -> u64 {
        self.current_in_flight.load(LOAD)
    }

    /// Requests completed, labeled by status class.
    pub fn requests_total(&self, class: StatusClass) -> u64 {
        self.requests_total[class.index()].load(LOAD)
    }

    /// Connections that went through at least one keep-alive cycle.
    pub fn connections_keep_alive(&self) -> u64 {
        self.connections_keep_alive.load(LOAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_and_close_balance_current_connections() {
        let metrics = Metrics::new();
        metrics.record_accepted();
        metrics.record_accepted();
        assert_eq!(metrics.current_connections(), 2);
        metrics.record_connection_closed();
        assert_eq!(metrics.current_connections(), 1);
        assert_eq!(metrics.accepted_total(), 2);
    }

    #[test]
    fn requests_labeled_by_status_class() {
        let metrics = Metrics::new();
        metrics.record_request(200, 0.002);
        metrics.record_request(500, 0.2);
        assert_eq!(metrics.requests_total(StatusClass::Success), 1);
        assert_eq!(metrics.requests_total(StatusClass::ServerError), 1);
    }
}
