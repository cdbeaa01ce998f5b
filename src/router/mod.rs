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

//! Method-indexed radix tree router.
//!
//! Immutable after the server enters `ready` (spec §3 invariant 4); matching
//! is a pure function of the tree (spec §8 invariant 4, STATIC > PARAM >
//! WILDCARD at every level).

mod params;

pub use params::Params;

use std::collections::HashMap;
use std::fmt;

use crate::context::Context;
use crate::request::Method;

/// A route handler: a pure dispatch target over a request/response [`Context`].
pub trait Handler: Send + Sync {
    /// Handles the request, mutating the response via `ctx`.
    fn call(&self, ctx: &mut Context<'_>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<F> Handler for F
where
    F: Fn(&mut Context<'_>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
{
    fn call(&self, ctx: &mut Context<'_>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self(ctx)
    }
}

/// Errors raised while building a [`Router`], before the server starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The same `(method, pattern)` was registered twice.
    #[error("duplicate route registered: {0:?} {1}")]
    Duplicate(Method, String),
    /// A wildcard segment (`*name`) appeared before the end of the pattern.
    #[error("wildcard segment must be the last segment: {0}")]
    WildcardNotLast(String),
}

enum InsertConflict {
    Duplicate,
    WildcardNotLast(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SegmentKind {
    Static(String),
    /// Interned once in `split_pattern` at route-registration time — never
    /// allocated again while matching requests.
    Param(&'static str),
    Wildcard(&'static str),
}

struct RadixNode {
    kind: SegmentKind,
    handler: Option<Box<dyn Handler>>,
    static_children: Vec<RadixNode>,
    param_child: Option<Box<RadixNode>>,
    wildcard_child: Option<Box<RadixNode>>,
}

impl RadixNode {
    fn new(kind: SegmentKind) -> Self {
        RadixNode {
            kind,
            handler: None,
            static_children: Vec::new(),
            param_child: None,
            wildcard_child: None,
        }
    }

    /// Returns `Err(())` if a handler is already terminal at this exact tree
    /// path (the caller turns that into a [`RouteError::Duplicate`] carrying
    /// the original `(method, pattern)`).
    fn insert(&mut self, segments: &[SegmentKind], handler: Box<dyn Handler>) -> Result<(), InsertConflict> {
        let Some((first, rest)) = segments.split_first() else {
            if self.handler.is_some() {
                return Err(InsertConflict::Duplicate);
            }
            self.handler = Some(handler);
            return Ok(());
        };

        match first {
            SegmentKind::Static(prefix) => {
                if let Some(child) = self
                    .static_children
                    .iter_mut()
                    .find(|c| matches!(&c.kind, SegmentKind::Static(p) if p == prefix))
                {
                    child.insert(rest, handler)
                } else {
                    let mut child = RadixNode::new(SegmentKind::Static(prefix.clone()));
                    child.insert(rest, handler)?;
                    self.static_children.push(child);
                    Ok(())
                }
            }
            SegmentKind::Param(name) => {
                if self.param_child.is_none() {
                    self.param_child = Some(Box::new(RadixNode::new(SegmentKind::Param(*name))));
                }
                self.param_child.as_mut().unwrap().insert(rest, handler)
            }
            SegmentKind::Wildcard(name) => {
                if !rest.is_empty() {
                    return Err(InsertConflict::WildcardNotLast(name.to_string()));
                }
                if self.wildcard_child.is_none() {
                    self.wildcard_child = Some(Box::new(RadixNode::new(SegmentKind::Wildcard(*name))));
                }
                self.wildcard_child.as_mut().unwrap().insert(rest, handler)
            }
        }
    }

    /// Traverses for `segments`, preferring STATIC over PARAM over WILDCARD
    /// at every level (spec §8 invariant 4).
    fn matches<'p>(&self, segments: &[&'p str], params: &mut Params<'p>) -> Option<&dyn Handler> {
        let Some((first, rest)) = segments.split_first() else {
            return self.handler.as_deref();
        };

        for child in &self.static_children {
            if let SegmentKind::Static(prefix) = &child.kind {
                if prefix == first {
                    let mut attempt = params.clone();
                    if let Some(h) = child.matches(rest, &mut attempt) {
                        *params = attempt;
                        return Some(h);
                    }
                }
            }
        }

        if let Some(child) = &self.param_child {
            let SegmentKind::Param(name) = &child.kind else {
                unreachable!()
            };
            let mut attempt = params.clone();
            attempt.push(*name, first);
            if let Some(h) = child.matches(rest, &mut attempt) {
                *params = attempt;
                return Some(h);
            }
        }

        if let Some(child) = &self.wildcard_child {
            let SegmentKind::Wildcard(name) = &child.kind else {
                unreachable!()
            };
            let remainder = join_remainder(segments);
            let mut attempt = params.clone();
            attempt.push(*name, remainder);
            if let Some(h) = child.matches(&[], &mut attempt) {
                *params = attempt;
                return Some(h);
            }
        }

        None
    }
}

/// Reconstructs the substring spanning every remaining segment, including
/// internal `/` separators, for a wildcard capture.
fn join_remainder<'p>(segments: &[&'p str]) -> &'p str {
    // Safety-free approach: reconstruct via the original path slice offsets.
    // Since callers always pass segments produced by `split_path`, which are
    // themselves substrings of one contiguous `&str`, the first segment's
    // start through the last segment's end spans the remainder including
    // internal `/` separators.
    match (segments.first(), segments.last()) {
        (Some(first), Some(last)) => {
            let start = first.as_ptr();
            let end = unsafe { last.as_ptr().add(last.len()) };
            let len = end as usize - start as usize;
            // Safety: both pointers derive from the same original `&str`
            // (see `split_path`), so this reconstructs the exact substring
            // spanning every remaining segment, including separators.
            unsafe {
                std::str::from_utf8_unchecked(std::slice::from_raw_parts(start, len))
            }
        }
        _ => "",
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn split_pattern(pattern: &str) -> Vec<SegmentKind> {
    split_path(pattern)
        .into_iter()
        .map(|seg| {
            if let Some(name) = seg.strip_prefix(':') {
                SegmentKind::Param(intern(name))
            } else if let Some(name) = seg.strip_prefix('*') {
                SegmentKind::Wildcard(intern(name))
            } else {
                SegmentKind::Static(seg.to_string())
            }
        })
        .collect()
}

/// Leaks `name` to obtain a `'static str` key for a captured parameter.
/// Called only from `split_pattern`, itself only reachable from
/// [`Router::register`]/[`Router::mount`] (spec §3 invariant 4: the tree is
/// never mutated once the server is `ready`), so the number of leaked
/// strings is bounded by the route table, never by request volume — matching
/// a request against the built tree reuses these interned names and never
/// calls this function.
fn intern(name: &str) -> &'static str {
    Box::leak(name.to_string().into_boxed_str())
}

/// A method-indexed collection of radix trees, one per HTTP method.
pub struct Router {
    trees: HashMap<Method, RadixNode>,
    registered: Vec<(Method, String)>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.registered)
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// An empty router.
    pub fn new() -> Self {
        Router {
            trees: HashMap::new(),
            registered: Vec::new(),
        }
    }

    /// Registers `handler` for `(method, pattern)`. Pre-start only; spec §3
    /// invariant 4 forbids mutating the tree once the server is `ready`.
    pub fn register(
        &mut self,
        method: Method,
        pattern: &str,
        handler: impl Handler + 'static,
    ) -> Result<(), RouteError> {
        if self
            .registered
            .iter()
            .any(|(m, p)| *m == method && p == pattern)
        {
            return Err(RouteError::Duplicate(method, pattern.to_string()));
        }

        let segments = split_pattern(pattern);
        let root = self
            .trees
            .entry(method)
            .or_insert_with(|| RadixNode::new(SegmentKind::Static(String::new())));
        root.insert(&segments, Box::new(handler))
            .map_err(|conflict| to_route_error(conflict, method, pattern))?;
        self.registered.push((method, pattern.to_string()));
        Ok(())
    }

    /// Merges every route of `other` into `self`, keeping `other`'s patterns
    /// unprefixed (spec §4.5 `include`).
    pub fn include(&mut self, other: Router) -> Result<(), RouteError> {
        self.mount("", other)
    }

    /// Merges every route of `sub`, prefixing each pattern with `prefix`
    /// (spec §4.5 `mount`). `sub` is consumed; its handlers are moved.
    pub fn mount(&mut self, prefix: &str, mut sub: Router) -> Result<(), RouteError> {
        let routes = std::mem::take(&mut sub.registered);
        for (method, pattern) in routes {
            let segments = split_pattern(&pattern);
            let sub_root = sub.trees.get_mut(&method).expect("registered pattern has a tree entry");
            let handler = take_handler(sub_root, &segments)
                .expect("registered pattern always resolves to a handler");

            let full_pattern = format!("{}/{}", prefix.trim_end_matches('/'), pattern.trim_start_matches('/'));
            let full_segments = split_pattern(&full_pattern);

            if self
                .registered
                .iter()
                .any(|(m, p)| *m == method && p == &full_pattern)
            {
                return Err(RouteError::Duplicate(method, full_pattern));
            }

            let root = self
                .trees
                .entry(method)
                .or_insert_with(|| RadixNode::new(SegmentKind::Static(String::new())));
            root.insert(&full_segments, handler)
                .map_err(|conflict| to_route_error(conflict, method, &full_pattern))?;
            self.registered.push((method, full_pattern));
        }
        Ok(())
    }

    /// Matches `(method, path)` against the tree. Pure function of the
    /// (immutable, post-start) tree, as required by spec §8 invariant 4.
    pub fn matches<'p>(&self, method: Method, path: &'p str) -> Option<(&dyn Handler, Params<'p>)> {
        let root = self.trees.get(&method)?;
        let segments = split_path(path);
        let mut params = Params::new();
        root.matches(&segments, &mut params).map(|h| (h, params))
    }

    /// Every registered `(method, pattern)` pair, in registration order.
    pub fn routes(&self) -> &[(Method, String)] {
        &self.registered
    }
}

fn to_route_error(conflict: InsertConflict, method: Method, pattern: &str) -> RouteError {
    match conflict {
        InsertConflict::Duplicate => RouteError::Duplicate(method, pattern.to_string()),
        InsertConflict::WildcardNotLast(name) => RouteError::WildcardNotLast(name),
    }
}

fn take_handler(node: &mut RadixNode, segments: &[SegmentKind]) -> Option<Box<dyn Handler>> {
    let Some((first, rest)) = segments.split_first() else {
        return node.handler.take();
    };
    match first {
        SegmentKind::Static(prefix) => node
            .static_children
            .iter_mut()
            .find(|c| matches!(&c.kind, SegmentKind::Static(p) if p == prefix))
            .and_then(|child| take_handler(child, rest)),
        SegmentKind::Param(_) => node
            .param_child
            .as_deref_mut()
            .and_then(|child| take_handler(child, rest)),
        SegmentKind::Wildcard(_) => node
            .wildcard_child
            .as_deref_mut()
            .and_then(|child| take_handler(child, rest)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler(_ctx: &mut Context<'_>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    #[test]
    fn static_route_matches() {
        let mut router = Router::new();
        router.register(Method::Get, "/health", ok_handler).unwrap();
        assert!(router.matches(Method::Get, "/health").is_some());
        assert!(router.matches(Method::Post, "/health").is_none());
    }

    #[test]
    fn param_route_captures_value() {
        let mut router = Router::new();
        router.register(Method::Get, "/users/:id", ok_handler).unwrap();
        let (_, params) = router.matches(Method::Get, "/users/42").unwrap();
        assert_eq!(params.get("id"), Some("42"));
    }

    #[test]
    fn wildcard_captures_remainder() {
        let mut router = Router::new();
        router.register(Method::Get, "/files/*path", ok_handler).unwrap();
        let (_, params) = router.matches(Method::Get, "/files/a/b/c.txt").unwrap();
        assert_eq!(params.get("path"), Some("a/b/c.txt"));
    }

    #[test]
    fn static_wins_over_param() {
        let mut router = Router::new();
        router.register(Method::Get, "/users/me", ok_handler).unwrap();
        router.register(Method::Get, "/users/:id", ok_handler).unwrap();
        let (_, params) = router.matches(Method::Get, "/users/me").unwrap();
        assert!(params.get("id").is_none());
    }

    #[test]
    fn param_wins_over_wildcard() {
        let mut router = Router::new();
        router.register(Method::Get, "/a/*rest", ok_handler).unwrap();
        router.register(Method::Get, "/a/:b", ok_handler).unwrap();
        let (_, params) = router.matches(Method::Get, "/a/x").unwrap();
        assert_eq!(params.get("b"), Some("x"));
        assert!(params.get("rest").is_none());
    }

    #[test]
    fn duplicate_registration_errors() {
        let mut router = Router::new();
        router.register(Method::Get, "/x", ok_handler).unwrap();
        assert!(router.register(Method::Get, "/x", ok_handler).is_err());
    }

    #[test]
    fn wildcard_must_be_last_segment() {
        let mut router = Router::new();
        assert!(router.register(Method::Get, "/*rest/more", ok_handler).is_err());
    }

    #[test]
    fn mount_prefixes_sub_router_patterns() {
        let mut sub = Router::new();
        sub.register(Method::Get, "/ping", ok_handler).unwrap();
        let mut root = Router::new();
        root.mount("/api", sub).unwrap();
        assert!(root.matches(Method::Get, "/api/ping").is_some());
    }

    #[test]
    fn no_match_returns_none() {
        let router = Router::new();
        assert!(router.matches(Method::Get, "/nope").is_none());
    }
}
