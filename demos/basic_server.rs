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

//! A minimal embedder, showing `App`'s fluent route registration, a
//! logging middleware, and a lifecycle hook. Run with `cargo run --example
//! basic_server` and `curl http://127.0.0.1:8080/hello/world`.

use aurora::{App, Context};

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let mut app = App::new();
    app.get("/", |ctx: &mut Context<'_>| {
        ctx.response().send(b"aurora is up".to_vec());
        Ok(())
    })
    .unwrap();

    app.get("/hello/:name", |ctx: &mut Context<'_>| {
        let name = ctx.param("name").unwrap_or("stranger").to_string();
        ctx.response().send(format!("hello, {name}").into_bytes());
        Ok(())
    })
    .unwrap();

    app.use_middleware(|ctx: &mut Context<'_>, next: aurora::middleware::Next<'_>| {
        let method = ctx.request().method();
        let path = ctx.request().path().to_string();
        let result = next.run(ctx);
        tracing::info!(%method, %path, "handled request");
        result
    });

    app.on_start(|| tracing::info!("aurora listening"));

    app.listen(|config| {
        config.host = "127.0.0.1".to_string();
        config.port = 8080;
    })
}
