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

//! Ordered middleware pipeline, run before the matched handler.
//!
//! Each middleware decides whether to call [`Next::run`] to continue toward
//! the handler, or to short-circuit by writing to the response and returning
//! without calling it (spec §4.5 "an earlier middleware may short-circuit").

use std::error::Error as StdError;

use crate::context::Context;
use crate::router::Handler;

type HandlerError = Box<dyn StdError + Send + Sync>;

/// A single middleware in the pipeline.
pub trait Middleware: Send + Sync {
    /// Runs this middleware. Call `next.run(ctx)` to continue the chain;
    /// omit the call to short-circuit.
    fn handle(&self, ctx: &mut Context<'_>, next: Next<'_>) -> Result<(), HandlerError>;
}

impl<F> Middleware for F
where
    F: Fn(&mut Context<'_>, Next<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, ctx: &mut Context<'_>, next: Next<'_>) -> Result<(), HandlerError> {
        self(ctx, next)
    }
}

/// Continuation handed to a middleware, representing "the rest of the
/// pipeline plus the matched handler".
pub struct Next<'a> {
    remaining: &'a [Box<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Runs the next middleware in the chain, or the matched handler once
    /// the chain is exhausted.
    pub fn run(self, ctx: &mut Context<'_>) -> Result<(), HandlerError> {
        match self.remaining.split_first() {
            Some((mw, rest)) => mw.handle(ctx, Next { remaining: rest, handler: self.handler }),
            None => self.handler.call(ctx),
        }
    }
}

/// An ordered, immutable-after-build chain of middleware terminated by a
/// matched route handler.
#[derive(Default)]
pub struct Pipeline {
    stack: Vec<Box<dyn Middleware>>,
}

impl Pipeline {
    /// An empty pipeline.
    pub fn new() -> Self {
        Pipeline { stack: Vec::new() }
    }

    /// Appends `middleware` to the end of the chain (outermost-registered
    /// runs first, matching spec §4.5 registration order).
    pub fn push(&mut self, middleware: impl Middleware + 'static) {
        self.stack.push(Box::new(middleware));
    }

    /// Appends an already-boxed `middleware`, for callers (e.g.
    /// [`crate::app::App`]) assembling a pipeline from a `Vec<Box<dyn
    /// Middleware>>` built up incrementally.
    pub fn push_boxed(&mut self, middleware: Box<dyn Middleware>) {
        self.stack.push(middleware);
    }

    /// Runs the full chain against `handler`.
    pub fn run(&self, ctx: &mut Context<'_>, handler: &dyn Handler) -> Result<(), HandlerError> {
        let next = Next { remaining: &self.stack, handler };
        next.run(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::request::{ParseOutcome, RequestView};
    use crate::response::Response;
    use crate::router::Params;

    fn view_for<'a>(buf: &'a [u8]) -> RequestView<'a> {
        match RequestView::parse(buf).unwrap() {
            ParseOutcome::Complete(v) => v,
            ParseOutcome::Partial => panic!("expected complete parse"),
        }
    }

    #[test]
    fn middleware_runs_before_handler() {
        let mut pipeline = Pipeline::new();
        pipeline.push(|ctx: &mut Context<'_>, next: Next<'_>| {
            ctx.response().header("X-Seen", "mw");
            next.run(ctx)
        });

        let handler = |ctx: &mut Context<'_>| -> Result<(), HandlerError> {
            ctx.response().send(b"ok".to_vec());
            Ok(())
        };

        let buf = b"GET / HTTP/1.1\r\n\r\n";
        let view = view_for(buf);
        let mut response = Response::new();
        let mut arena = Arena::new(64);
        let mut ctx = Context::new(&view, &mut response, Params::new(), &mut arena);
        pipeline.run(&mut ctx, &handler).unwrap();

        assert_eq!(ctx.response().get_header("X-Seen"), Some("mw"));
    }

    #[test]
    fn short_circuit_skips_handler() {
        let mut pipeline = Pipeline::new();
        pipeline.push(|ctx: &mut Context<'_>, _next: Next<'_>| {
            ctx.response().status(crate::response::StatusCode::BadRequest);
            Ok(())
        });

        let handler = |ctx: &mut Context<'_>| -> Result<(), HandlerError> {
            ctx.response().send(b"should not run".to_vec());
            Ok(())
        };

        let buf = b"GET / HTTP/1.1\r\n\r\n";
        let view = view_for(buf);
        let mut response = Response::new();
        let mut arena = Arena::new(64);
        let mut ctx = Context::new(&view, &mut response, Params::new(), &mut arena);
        pipeline.run(&mut ctx, &handler).unwrap();

        assert_eq!(ctx.response().status_code(), crate::response::StatusCode::BadRequest);
        assert!(ctx.response().get_header("Content-Length").is_none());
    }
}
