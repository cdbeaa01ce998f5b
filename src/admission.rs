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

//! Connection/in-flight admission, load shedding, and health signals
//! (spec §4.10). Shared read-mostly state across every Worker; every check
//! here is a handful of atomic loads, never a lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{glob_match, ServerConfig};
use crate::metrics::Metrics;

const LOAD: Ordering = Ordering::Relaxed;

/// Shared admission/health state, one instance per [`crate::server::Server`].
#[derive(Debug)]
pub struct Admission {
    config: Arc<ServerConfig>,
    metrics: Arc<Metrics>,
    refusing_connections: AtomicBool,
    ready: AtomicBool,
    shutting_down: AtomicBool,
    startup_complete: AtomicBool,
}

impl Admission {
    /// Builds admission state over `config`, observing `metrics` for the
    /// live counters hysteresis and in-flight gating need.
    pub fn new(config: Arc<ServerConfig>, metrics: Arc<Metrics>) -> Self {
        Admission {
            config,
            metrics,
            refusing_connections: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            startup_complete: AtomicBool::new(false),
        }
    }

    /// Whether a newly-accepted socket should be kept, applying the
    /// high/low-water hysteresis over `current_connections` (spec §4.10).
    pub fn allow_accept(&self) -> bool {
        if self.shutting_down.load(LOAD) {
            return false;
        }
        let current = self.metrics.current_connections() as usize;
        if self.refusing_connections.load(LOAD) {
            if current < self.config.low_water_mark() {
                self.refusing_connections.store(false, LOAD);
            }
        } else if current >= self.config.high_water_mark() {
            self.refusing_connections.store(true, LOAD);
        }
        !self.refusing_connections.load(LOAD)
    }

    /// Whether a request may transition into `PROCESSING` (spec §4.4 step 6,
    /// §4.10 "in-flight cap").
    pub fn allow_in_flight(&self) -> bool {
        (self.metrics.current_in_flight() as usize) < self.config.max_in_flight_requests
    }

    /// Whether `path` should be shed under load, given a caller-supplied
    /// uniform random draw in `[0, 1)` (the PRNG itself is per-worker, kept
    /// out of this shared struct to avoid any cross-thread state).
    pub fn should_shed(&self, path: &str, random_draw: f64) -> bool {
        if self.config.shed_ratio <= 0.0 {
            return false;
        }
        if self
            .config
            .shed_bypass_globs
            .iter()
            .any(|glob| glob_match(glob, path))
        {
            return false;
        }
        random_draw < self.config.shed_ratio
    }

    /// Marks the server `ready` to accept connections.
    pub fn mark_ready(&self) {
        self.ready.store(true, LOAD);
    }

    /// Marks graceful shutdown as started; readiness flips to `false`
    /// immediately (spec §4.9 "`/health/ready` returns 503 once
    /// `shutting_down` is set").
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, LOAD);
    }

    /// Whether [`Admission::begin_shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(LOAD)
    }

    /// Liveness: the process is running and this admission state exists,
    /// which is equivalent to "the Worker/Reactor are alive" for a
    /// synchronous single-process embedding.
    pub fn liveness(&self) -> bool {
        true
    }

    /// Readiness: `ready && !shutting_down && !overloaded`.
    pub fn readiness(&self) -> bool {
        self.ready.load(LOAD) && !self.shutting_down.load(LOAD) && !self.overloaded()
    }

    /// Startup: toggled only by [`Admission::mark_startup_complete`].
    pub fn startup(&self) -> bool {
        self.startup_complete.load(LOAD)
    }

    /// Signals that application-defined startup work has finished.
    pub fn mark_startup_complete(&self) {
        self.startup_complete.store(true, LOAD);
    }

    /// Whether the server is currently above its high-water connection mark.
    pub fn overloaded(&self) -> bool {
        self.refusing_connections.load(LOAD)
    }
}

/// Minimal per-worker PRNG for `shed_ratio` sampling. A full `rand`
/// dependency would be overkill for a single `u64 -> [0,1)` draw on the hot
/// path; xorshift64 is a handful of instructions and has no shared state.
pub struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    /// Seeds the generator; `seed` must be non-zero.
    pub fn new(seed: u64) -> Self {
        Xorshift64 { state: seed.max(1) }
    }

    /// Next pseudo-random `u64`.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Next uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission_with(config: ServerConfig) -> Admission {
        Admission::new(Arc::new(config), Arc::new(Metrics::new()))
    }

    #[test]
    fn allow_accept_applies_hysteresis() {
        let mut config = ServerConfig::default();
        config.max_connections = 10;
        let admission = admission_with(config);
        for _ in 0..9 {
            admission.metrics.record_accepted();
        }
        assert!(admission.allow_accept());
        admission.metrics.record_accepted();
        assert!(!admission.allow_accept());
    }

    #[test]
    fn shed_bypass_glob_always_allows() {
        let mut config = ServerConfig::default();
        config.shed_ratio = 1.0;
        config.shed_bypass_globs = vec!["/health/*".to_string()];
        let admission = admission_with(config);
        assert!(!admission.should_shed("/health/ready", 0.0));
        assert!(admission.should_shed("/users", 0.0));
    }

    #[test]
    fn readiness_false_once_shutting_down() {
        let admission = admission_with(ServerConfig::default());
        admission.mark_ready();
        assert!(admission.readiness());
        admission.begin_shutdown();
        assert!(!admission.readiness());
    }

    #[test]
    fn xorshift_produces_unit_range_draws() {
        let mut rng = Xorshift64::new(42);
        for _ in 0..1000 {
            let draw = rng.next_f64();
            assert!((0.0..1.0).contains(&draw));
        }
    }
}
