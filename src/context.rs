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

//! The bundle a [`Handler`](crate::router::Handler) and every middleware in
//! the pipeline see: the parsed request, the response under construction,
//! captured path parameters, and a per-request scratch map.

use std::any::Any;
use std::collections::HashMap;

use crate::arena::Arena;
use crate::request::RequestView;
use crate::response::Response;
use crate::router::Params;

/// Per-request key/value storage for passing data between middleware and the
/// handler (e.g. an authenticated principal attached by an auth middleware).
/// Keyed by a static string; one value per key.
#[derive(Default)]
pub struct Storage {
    entries: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl Storage {
    /// An empty storage map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `key`, replacing anything already stored there.
    pub fn insert<T: Any + Send>(&mut self, key: &'static str, value: T) {
        self.entries.insert(key, Box::new(value));
    }

    /// Retrieves a reference to the value stored under `key`, if present and
    /// of type `T`.
    pub fn get<T: Any + Send>(&self, key: &'static str) -> Option<&T> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Retrieves a mutable reference to the value stored under `key`, if
    /// present and of type `T`.
    pub fn get_mut<T: Any + Send>(&mut self, key: &'static str) -> Option<&mut T> {
        self.entries.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    /// Removes and returns the value stored under `key`, if present and of
    /// type `T`.
    pub fn remove<T: Any + Send>(&mut self, key: &'static str) -> Option<T> {
        self.entries.remove(key).and_then(|v| v.downcast::<T>().ok()).map(|b| *b)
    }
}

/// The per-request context threaded through middleware and the matched
/// handler. Borrows the request view and captured params for the lifetime of
/// a single `process` call (spec §4.4); never stored past that call.
pub struct Context<'r> {
    request: &'r RequestView<'r>,
    response: &'r mut Response,
    params: Params<'r>,
    storage: Storage,
    arena: &'r mut Arena,
}

impl<'r> Context<'r> {
    /// Builds a context from the request view, the in-progress response, the
    /// params captured by the router match, and the Worker's per-request
    /// arena (reset by the Connection once the response has been written).
    pub fn new(
        request: &'r RequestView<'r>,
        response: &'r mut Response,
        params: Params<'r>,
        arena: &'r mut Arena,
    ) -> Self {
        Context {
            request,
            response,
            params,
            storage: Storage::new(),
            arena,
        }
    }

    /// Per-request bump allocator, reset after the response is written; a
    /// scratch area for handlers that want to avoid a heap allocation for
    /// transient request-scoped data.
    pub fn arena(&mut self) -> &mut Arena {
        self.arena
    }

    /// The parsed request.
    pub fn request(&self) -> &RequestView<'r> {
        self.request
    }

    /// The response under construction.
    pub fn response(&mut self) -> &mut Response {
        self.response
    }

    /// A captured path parameter, e.g. `:id` in `/users/:id`.
    pub fn param(&self, name: &str) -> Option<&'r str> {
        self.params.get(name)
    }

    /// All captured path parameters.
    pub fn params(&self) -> &Params<'r> {
        &self.params
    }

    /// Per-request scratch storage, shared across every middleware and the
    /// final handler invocation.
    pub fn storage(&mut self) -> &mut Storage {
        &mut self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ParseOutcome;

    #[test]
    fn storage_round_trips_typed_values() {
        let mut storage = Storage::new();
        storage.insert("user_id", 42u64);
        assert_eq!(storage.get::<u64>("user_id"), Some(&42));
        assert_eq!(storage.get::<&str>("user_id"), None);
    }

    #[test]
    fn context_exposes_params_and_request() {
        let buf = b"GET /users/42 HTTP/1.1\r\nHost: x\r\n\r\n";
        let view = match RequestView::parse(buf).unwrap() {
            ParseOutcome::Complete(v) => v,
            ParseOutcome::Partial => panic!("expected complete parse"),
        };
        let mut params = Params::new();
        params.push("id", "42");
        let mut response = Response::new();
        let mut arena = Arena::new(64);
        let ctx = Context::new(&view, &mut response, params, &mut arena);
        assert_eq!(ctx.param("id"), Some("42"));
        assert_eq!(ctx.request().path(), "/users/42");
    }
}
