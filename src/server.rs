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

//! Multi-worker supervisor (spec §4.9): binds the listener once, spawns
//! `resolved_worker_count()` [`Worker`]s each over its own clone of that
//! listener, and coordinates graceful shutdown.
//!
//! Grounded in `examples/ryanseipp-rask-old/examples/example_server.rs`'s `TcpListener::bind` +
//! `try_clone()`-per-thread + `thread::spawn`/`join` shape; the teacher's
//! alternate `listener.rs`/`worker.rs` (single accept thread fanning work out
//! over a `crossbeam_channel` to a pool of workers behind `Arc<Mutex<_>>`) is
//! not carried forward — see DESIGN.md.

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::admission::Admission;
use crate::config::ServerConfig;
use crate::error::ExceptionHandlers;
use crate::metrics::Metrics;
use crate::middleware::Pipeline;
use crate::router::Router;
use crate::worker::Worker;

/// A running server's shared handles, returned by [`Server::start`]. Cloning
/// it gives every clone the same `stop()`/`handle()` authority; there is only
/// ever one set of wakers and one `Admission` underneath.
#[derive(Clone)]
pub struct Handle {
    admission: Arc<Admission>,
    metrics: Arc<Metrics>,
    wakers: Arc<Vec<Arc<mio::Waker>>>,
}

impl Handle {
    /// Begins graceful shutdown (spec §4.9): flips `shutting_down` (so
    /// `/health/ready` answers `503` and `Admission::allow_accept` refuses
    /// new sockets immediately) and wakes every Worker's Reactor so each one
    /// notices on its next loop iteration, without waiting for its next
    /// socket event or `Date` tick.
    pub fn stop(&self) {
        self.admission.begin_shutdown();
        for waker in self.wakers.iter() {
            let _ = waker.wake();
        }
    }

    /// The shared metrics handle, for an embedder to read counters from
    /// outside the request path.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The shared admission/health handle, e.g. for a supervisor process to
    /// poll readiness directly rather than over HTTP.
    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }
}

/// Everything the Workers need that does not belong to any one of them:
/// router, middleware, exception handlers, config, metrics, admission.
/// Immutable after [`Server::start`] (spec §4.9 "the radix tree is not
/// mutated after the Server enters `ready`").
pub struct Server {
    router: Arc<Router>,
    pipeline: Arc<Pipeline>,
    exception_handlers: Arc<ExceptionHandlers>,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Bundles the shared, read-mostly state an [`crate::app::App`] has
    /// built up into a `Server` ready to [`Server::start`].
    pub fn new(
        router: Router,
        pipeline: Pipeline,
        exception_handlers: ExceptionHandlers,
        config: ServerConfig,
    ) -> Self {
        Server {
            router: Arc::new(router),
            pipeline: Arc::new(pipeline),
            exception_handlers: Arc::new(exception_handlers),
            config: Arc::new(config),
        }
    }

    /// Start sequence (spec §4.9): bind the listener, create `N` Workers over
    /// `try_clone()`s of it, mark `ready`, and hand each Worker off to its
    /// own thread. Returns immediately with a [`Handle`] and the threads'
    /// `JoinHandle`s; call [`Server::join`] (or join them directly) to block
    /// until every Worker has stopped.
    pub fn start(self) -> io::Result<(Handle, Vec<JoinHandle<()>>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let std_listener = StdTcpListener::bind(&addr)?;
        std_listener.set_nonblocking(true)?;

        let metrics = Arc::new(Metrics::new());
        let admission = Arc::new(Admission::new(self.config.clone(), metrics.clone()));

        let worker_count = self.config.resolved_worker_count();
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let listener = mio::net::TcpListener::from_std(std_listener.try_clone()?);
            let worker = Worker::new(
                id,
                listener,
                self.router.clone(),
                self.pipeline.clone(),
                self.exception_handlers.clone(),
                self.config.clone(),
                metrics.clone(),
                admission.clone(),
            )?;
            workers.push(worker);
        }

        let wakers = Arc::new(workers.iter().map(Worker::waker).collect::<Vec<_>>());
        admission.mark_ready();

        let threads = workers
            .into_iter()
            .map(|worker| {
                let id = worker.id();
                thread::Builder::new()
                    .name(format!("aurora-worker-{id}"))
                    .spawn(move || worker.run())
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Ok((
            Handle {
                admission,
                metrics,
                wakers,
            },
            threads,
        ))
    }

    /// Blocks the calling thread until every Worker thread has returned,
    /// i.e. until graceful shutdown has fully drained (spec §4.9 "join
    /// Workers; release pools" — pools are released implicitly when each
    /// `Worker` is dropped at the end of its thread closure).
    pub fn join(threads: Vec<JoinHandle<()>>) {
        for thread in threads {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn test_server(port: u16) -> Server {
        let mut router = Router::new();
        router
            .register(crate::request::Method::Get, "/", |ctx: &mut crate::context::Context<'_>| {
                ctx.response().send(b"ok".to_vec());
                Ok(())
            })
            .unwrap();

        let mut config = ServerConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = port;
        config.workers = 1;

        Server::new(router, Pipeline::new(), ExceptionHandlers::new(), config)
    }

    #[test]
    fn start_serves_requests_then_stops_on_handle() {
        let server = test_server(0);
        let (handle, threads) = server.start().unwrap();

        assert!(handle.admission().readiness());

        handle.stop();
        assert!(handle.admission().is_shutting_down());
        Server::join(threads);
    }

    #[test]
    fn bound_port_accepts_a_real_connection() {
        let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = std_listener.local_addr().unwrap().port();
        drop(std_listener);

        let server = test_server(port);
        let (handle, threads) = server.start().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 200 OK\r\n"));

        handle.stop();
        Server::join(threads);
    }
}
