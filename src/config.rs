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

//! Server configuration, builder-constructed. Config *file* loading is out
//! of scope (spec §1); everything here is a plain struct with documented
//! defaults, mutated before [`crate::app::App::listen`] is called.

use std::time::Duration;

/// What an overloaded server does with a refused connection or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadBehavior {
    /// Accept the socket/request just long enough to write a synthetic
    /// `503 Service Unavailable` with `Retry-After`, then close.
    Reject503,
    /// Drop the connection without writing a response (`SO_LINGER` reset).
    Rst,
}

/// The three health-check paths the admission layer answers directly,
/// bypassing routing (spec §4.10).
#[derive(Debug, Clone)]
pub struct HealthPaths {
    /// Process-alive check; always `200` once the reactor is running.
    pub liveness: String,
    /// `200` iff `ready && !shutting_down && !overloaded`.
    pub readiness: String,
    /// Toggled by an explicit embedder signal, not derived automatically.
    pub startup: String,
}

impl Default for HealthPaths {
    fn default() -> Self {
        HealthPaths {
            liveness: "/health/live".to_string(),
            readiness: "/health/ready".to_string(),
            startup: "/health/startup".to_string(),
        }
    }
}

/// Every tunable named in spec §6 "Configuration (enumerated)".
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen host, e.g. `"0.0.0.0"`.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Worker thread count; `0` means `max(1, physical_cores - 1)`.
    pub workers: usize,

    /// Hard cap on simultaneous connections across all workers.
    pub max_connections: usize,
    /// Fraction of `max_connections` above which new accepts are refused.
    pub connection_high_water: f64,
    /// Fraction of `max_connections` below which accepts resume.
    pub connection_low_water: f64,

    /// Cap on requests concurrently in `PROCESSING` across all workers.
    pub max_in_flight_requests: usize,
    /// What to do when a connection or request is refused by admission.
    pub overload_behavior: OverloadBehavior,
    /// `Retry-After` value sent with a `503`.
    pub retry_after_seconds: u32,

    /// Maximum requests served on one keep-alive connection before it is
    /// forced closed (spec §3 invariant 5).
    pub max_requests_per_connection: u32,

    /// Deadline for completing the header (and body, if any) read.
    pub read_deadline: Duration,
    /// Deadline for completing the response write.
    pub write_deadline: Duration,
    /// Deadline for receiving the next request on a keep-alive connection.
    pub keep_alive_deadline: Duration,

    /// Header section size cap before a `431` is returned.
    pub max_header_bytes: usize,
    /// Body size cap before a `413` is returned.
    pub max_body_bytes: usize,

    /// How long graceful shutdown waits for in-flight requests to finish.
    pub grace_period: Duration,

    /// Health endpoint paths.
    pub health_paths: HealthPaths,

    /// Fraction (0.0–1.0) of otherwise-admitted requests shed under load.
    pub shed_ratio: f64,
    /// Path prefixes/suffixes exempt from shedding (e.g. health endpoints).
    /// Supports a leading or trailing `*` wildcard; see [`glob_match`].
    pub shed_bypass_globs: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: 0,

            max_connections: 10_000,
            connection_high_water: 0.9,
            connection_low_water: 0.7,

            max_in_flight_requests: 1_000,
            overload_behavior: OverloadBehavior::Reject503,
            retry_after_seconds: 1,

            max_requests_per_connection: 100,

            read_deadline: Duration::from_secs(10),
            write_deadline: Duration::from_secs(10),
            keep_alive_deadline: Duration::from_secs(75),

            max_header_bytes: 8 * 1024,
            max_body_bytes: 2 * 1024 * 1024,

            grace_period: Duration::from_secs(30),

            health_paths: HealthPaths::default(),

            shed_ratio: 0.0,
            shed_bypass_globs: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// A config with every spec-default value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `workers == 0` to `max(1, physical_cores - 1)`.
    pub fn resolved_worker_count(&self) -> usize {
        if self.workers != 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1)
    }

    /// The absolute connection count at/above which new accepts are refused.
    pub fn high_water_mark(&self) -> usize {
        (self.max_connections as f64 * self.connection_high_water) as usize
    }

    /// The absolute connection count below which accepts resume once
    /// refusing.
    pub fn low_water_mark(&self) -> usize {
        (self.max_connections as f64 * self.connection_low_water) as usize
    }
}

/// Minimal glob match supporting a single leading or trailing `*`, enough
/// for `shed_bypass_globs` prefix/suffix exemptions (spec §B.3 — a full glob
/// crate would be a dependency for its own sake at this scale).
pub fn glob_match(pattern: &str, path: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        path.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        path.starts_with(prefix)
    } else {
        pattern == path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ServerConfig::default();
        assert_eq!(config.max_requests_per_connection, 100);
        assert_eq!(config.max_header_bytes, 8 * 1024);
        assert_eq!(config.max_body_bytes, 2 * 1024 * 1024);
        assert_eq!(config.connection_high_water, 0.9);
        assert_eq!(config.connection_low_water, 0.7);
    }

    #[test]
    fn water_marks_scale_with_max_connections() {
        let mut config = ServerConfig::default();
        config.max_connections = 100;
        assert_eq!(config.high_water_mark(), 90);
        assert_eq!(config.low_water_mark(), 70);
    }

    #[test]
    fn glob_prefix_and_suffix() {
        assert!(glob_match("/health/*", "/health/ready"));
        assert!(glob_match("*.css", "style.css"));
        assert!(!glob_match("/health/*", "/other"));
    }
}
