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

//! Aurora is a synchronous, non-blocking HTTP/1.1 server framework core: a
//! reactor over `mio`, pooled read/write buffers, a per-request bump arena,
//! a radix-tree router, a middleware pipeline, and a multi-worker
//! supervisor with admission control and graceful shutdown. TLS, HTTP/2/3,
//! and config-file loading are out of scope — see each module's doc comment
//! for its slice of the design.

pub mod admission;
pub mod app;
pub mod arena;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod reactor;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod worker;

pub use app::App;
pub use config::ServerConfig;
pub use context::Context;
pub use error::AuroraError;
pub use response::{Response, StatusCode};
pub use router::Router;
pub use server::{Handle, Server};
