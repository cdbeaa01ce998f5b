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

//! The embedder-facing builder (spec §6 "Embedder API"): register routes and
//! middleware, then [`App::listen`] to block serving traffic until
//! [`crate::server::Handle::stop`] is called.

use std::io;

use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::ExceptionHandlers;
use crate::middleware::{Middleware, Next};
use crate::request::Method;
use crate::router::{Handler, RouteError, Router};
use crate::server::{Handle, Server};

type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// `on_start`/`on_stop` fire once, around the whole server's lifetime.
type LifecycleHook = Box<dyn Fn() + Send + Sync>;
/// `on_request` fires once per request, before routing/middleware run.
type RequestHook = Box<dyn Fn(&mut Context<'_>) + Send + Sync>;
/// `on_response` fires once per request, after the pipeline has finished
/// (whether it succeeded or short-circuited).
type ResponseHook = Box<dyn Fn(&mut Context<'_>) + Send + Sync>;
/// `on_error` fires when the pipeline or the matched handler returns `Err`.
type ErrorHook = Box<dyn Fn(&mut Context<'_>, &HandlerError) + Send + Sync>;

/// Builds an Aurora application: routes, middleware, typed exception
/// handlers, lifecycle hooks, and configuration, then [`App::listen`]s.
/// Mirrors the teacher's `examples/ryanseipp-rask-old/examples/example_server.rs` entry point, but as a
/// reusable builder rather than a fixed `main`.
#[derive(Default)]
pub struct App {
    router: Router,
    pipeline_stack: Vec<Box<dyn Middleware>>,
    exception_handlers: ExceptionHandlers,
    config: ServerConfig,

    on_start: Vec<LifecycleHook>,
    on_stop: Vec<LifecycleHook>,
    on_request: Vec<RequestHook>,
    on_response: Vec<ResponseHook>,
    on_error: Vec<ErrorHook>,
}

impl App {
    /// An app with an empty router, no middleware, and spec-default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a `GET` route. Pre-start only (spec §3 invariant 4).
    pub fn get(&mut self, pattern: &str, handler: impl Handler + 'static) -> Result<&mut Self, RouteError> {
        self.router.register(Method::Get, pattern, handler)?;
        Ok(self)
    }

    /// Registers a `POST` route.
    pub fn post(&mut self, pattern: &str, handler: impl Handler + 'static) -> Result<&mut Self, RouteError> {
        self.router.register(Method::Post, pattern, handler)?;
        Ok(self)
    }

    /// Registers a `PUT` route.
    pub fn put(&mut self, pattern: &str, handler: impl Handler + 'static) -> Result<&mut Self, RouteError> {
        self.router.register(Method::Put, pattern, handler)?;
        Ok(self)
    }

    /// Registers a `DELETE` route.
    pub fn delete(&mut self, pattern: &str, handler: impl Handler + 'static) -> Result<&mut Self, RouteError> {
        self.router.register(Method::Delete, pattern, handler)?;
        Ok(self)
    }

    /// Registers a `PATCH` route.
    pub fn patch(&mut self, pattern: &str, handler: impl Handler + 'static) -> Result<&mut Self, RouteError> {
        self.router.register(Method::Patch, pattern, handler)?;
        Ok(self)
    }

    /// Registers a `HEAD` route.
    pub fn head(&mut self, pattern: &str, handler: impl Handler + 'static) -> Result<&mut Self, RouteError> {
        self.router.register(Method::Head, pattern, handler)?;
        Ok(self)
    }

    /// Registers an `OPTIONS` route.
    pub fn options(&mut self, pattern: &str, handler: impl Handler + 'static) -> Result<&mut Self, RouteError> {
        self.router.register(Method::Options, pattern, handler)?;
        Ok(self)
    }

    /// Appends `middleware` to the pipeline, run in registration order before
    /// the matched handler (spec §4.5, §6 `use_middleware`).
    pub fn use_middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.pipeline_stack.push(Box::new(middleware));
        self
    }

    /// Merges `sub`'s routes under `prefix` (spec §4.5, §6).
    pub fn mount(&mut self, prefix: &str, sub: Router) -> Result<&mut Self, RouteError> {
        self.router.mount(prefix, sub)?;
        Ok(self)
    }

    /// Registers a typed exception handler (spec §6 `set_exception_handler<E>`).
    pub fn set_exception_handler<E, F>(&mut self, mapper: F) -> &mut Self
    where
        E: std::error::Error + 'static,
        F: Fn(&E) -> crate::response::Response + Send + Sync + 'static,
    {
        self.exception_handlers.register(mapper);
        self
    }

    /// Runs `hook` once, after every Worker has started and the server is
    /// marked `ready` (spec §6 `on_start`).
    pub fn on_start(&mut self, hook: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.on_start.push(Box::new(hook));
        self
    }

    /// Runs `hook` once, after [`Server::join`] returns (spec §6 `on_stop`).
    pub fn on_stop(&mut self, hook: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.on_stop.push(Box::new(hook));
        self
    }

    /// Runs `hook` for every request, before middleware and the matched
    /// handler (spec §6 `on_request`).
    pub fn on_request(&mut self, hook: impl Fn(&mut Context<'_>) + Send + Sync + 'static) -> &mut Self {
        self.on_request.push(Box::new(hook));
        self
    }

    /// Runs `hook` for every request, after the pipeline has finished,
    /// whether it succeeded or an earlier middleware short-circuited (spec
    /// §6 `on_response`).
    pub fn on_response(&mut self, hook: impl Fn(&mut Context<'_>) + Send + Sync + 'static) -> &mut Self {
        self.on_response.push(Box::new(hook));
        self
    }

    /// Runs `hook` whenever the pipeline or matched handler returns `Err`
    /// (spec §6 `on_error`). Does not see connection-level errors that never
    /// reach the pipeline (malformed requests, admission refusals) — those
    /// are mapped directly to a response by the Connection state machine
    /// (spec §4.4) before any handler runs.
    pub fn on_error(&mut self, hook: impl Fn(&mut Context<'_>, &HandlerError) + Send + Sync + 'static) -> &mut Self {
        self.on_error.push(Box::new(hook));
        self
    }

    /// Mutable access to the configuration this app will [`App::listen`]
    /// with (spec §6 "Configuration (enumerated)").
    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Binds and starts serving, blocking the calling thread until the
    /// returned [`Handle::stop`] is called from elsewhere and every Worker
    /// has drained (spec §6 `listen(addr) -> blocks until stop()`).
    ///
    /// `addr_setup` lets a caller adjust `host`/`port` just before binding
    /// (e.g. from a CLI flag) without a separate builder step; most callers
    /// can pass `|_| {}` and set `host`/`port` via [`App::config_mut`].
    pub fn listen(mut self, addr_setup: impl FnOnce(&mut ServerConfig)) -> io::Result<()> {
        addr_setup(&mut self.config);
        let (_handle, threads, on_start, on_stop) = self.into_started()?;

        for hook in &on_start {
            hook();
        }
        Server::join(threads);
        for hook in &on_stop {
            hook();
        }
        Ok(())
    }

    /// Starts the server and returns its [`Handle`] plus every piece
    /// [`App::listen`]/[`listen_in_background`] still needs to run the
    /// lifecycle around `Server::join`. Shared so both blocking entry points
    /// build the `Server` (router + synthesized [`LifecycleWrapper`] +
    /// exception handlers + config) exactly the same way.
    fn into_started(
        self,
    ) -> io::Result<(Handle, Vec<std::thread::JoinHandle<()>>, Vec<LifecycleHook>, Vec<LifecycleHook>)> {
        let hooks = LifecycleWrapper {
            on_request: self.on_request,
            on_response: self.on_response,
            on_error: self.on_error,
        };
        let mut pipeline_stack = self.pipeline_stack;
        if hooks.has_any() {
            // Registered first so it wraps every user-registered middleware,
            // matching the teacher's general rule that the first-pushed
            // middleware is outermost (see `middleware.rs::Pipeline::push`).
            pipeline_stack.insert(0, Box::new(hooks));
        }

        let mut pipeline = crate::middleware::Pipeline::new();
        for middleware in pipeline_stack {
            pipeline.push_boxed(middleware);
        }

        let server = Server::new(self.router, pipeline, self.exception_handlers, self.config);
        let (handle, threads) = server.start()?;
        Ok((handle, threads, self.on_start, self.on_stop))
    }
}

/// Wraps the three per-request hook sets into one [`Middleware`] pushed
/// outermost, so on_request/on_response/on_error fire without the Connection
/// state machine needing to know about `App` at all.
struct LifecycleWrapper {
    on_request: Vec<RequestHook>,
    on_response: Vec<ResponseHook>,
    on_error: Vec<ErrorHook>,
}

impl LifecycleWrapper {
    fn has_any(&self) -> bool {
        !self.on_request.is_empty() || !self.on_response.is_empty() || !self.on_error.is_empty()
    }
}

impl Middleware for LifecycleWrapper {
    fn handle(&self, ctx: &mut Context<'_>, next: Next<'_>) -> Result<(), HandlerError> {
        for hook in &self.on_request {
            hook(ctx);
        }

        let result = next.run(ctx);

        if let Err(ref err) = result {
            for hook in &self.on_error {
                hook(ctx, err);
            }
        }

        for hook in &self.on_response {
            hook(ctx);
        }

        result
    }
}

/// Returns a [`Handle`] once the app's server has started, for a caller that
/// wants to trigger [`Handle::stop`] from another thread (e.g. a signal
/// handler) while [`App::listen`] blocks on this one. Spawns the blocking
/// `listen` call onto its own thread and hands the handle back once the
/// server reports `ready`.
pub fn listen_in_background(
    mut app: App,
    addr_setup: impl FnOnce(&mut ServerConfig),
) -> io::Result<(Handle, std::thread::JoinHandle<io::Result<()>>)> {
    addr_setup(&mut app.config);
    let (handle, threads, on_start, on_stop) = app.into_started()?;
    let returned_handle = handle.clone();

    let join = std::thread::spawn(move || -> io::Result<()> {
        for hook in &on_start {
            hook();
        }
        Server::join(threads);
        for hook in &on_stop {
            hook();
        }
        Ok(())
    });

    Ok((returned_handle, join))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn route_registration_is_fluent_and_rejects_duplicates() {
        let mut app = App::new();
        app.get("/", |ctx: &mut Context<'_>| {
            ctx.response().send(b"hi".to_vec());
            Ok(())
        })
        .unwrap();
        let err = app.get("/", |ctx: &mut Context<'_>| {
            ctx.response().send(b"hi".to_vec());
            Ok(())
        });
        assert!(err.is_err());
    }

    #[test]
    fn lifecycle_hooks_fire_once_per_request() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut app = App::new();
        app.get("/", |ctx: &mut Context<'_>| {
            ctx.response().send(b"ok".to_vec());
            Ok(())
        })
        .unwrap();

        let requests = Arc::new(AtomicUsize::new(0));
        let responses = Arc::new(AtomicUsize::new(0));
        let (request_seen, response_seen) = (requests.clone(), responses.clone());
        app.on_request(move |_ctx| {
            request_seen.fetch_add(1, Ordering::SeqCst);
        });
        app.on_response(move |_ctx| {
            response_seen.fetch_add(1, Ordering::SeqCst);
        });

        app.config_mut().host = "127.0.0.1".to_string();
        app.config_mut().port = port;
        app.config_mut().workers = 1;

        let (handle, join) = listen_in_background(app, |_| {}).unwrap();

        use std::io::{Read, Write};
        let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 200 OK\r\n"));

        handle.stop();
        join.join().unwrap().unwrap();

        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert_eq!(responses.load(Ordering::SeqCst), 1);
    }
}
