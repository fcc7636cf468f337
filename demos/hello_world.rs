//! A small webx application.
//!
//! ```text
//! cargo run --example hello_world
//! curl localhost:8080/                      # HTML page
//! curl 'localhost:8080/?format=json'        # same data as JSON
//! curl localhost:8080/hello/ferris
//! curl -c jar -b jar localhost:8080/visits  # session counter
//! curl -u admin:secret localhost:8080/admin/dashboard
//! ```
//!
//! Set `WEBX_CONFIG` to a TOML file to override the defaults.

use std::io;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use webx::context::Context;
use webx::middleware::{
    BasicAuth, Gzip, Logger, MaxAllowed, TrailingSlash, from_middleware, handler_fn,
};
use webx::render::{AutoOutput, Data, Renderer};
use webx::{App, Config, Router, StatusCode};

/// Dumps the payload into a bare HTML page.
struct DebugPage;

impl Renderer for DebugPage {
    fn render(&self, out: &mut dyn io::Write, name: &str, data: &Value, ctx: &Context) -> webx::Result<()> {
        let info = ctx.call_func("Info", &[]).unwrap_or(Value::Null);
        let pretty = serde_json::to_string_pretty(data)?;
        write!(out, "<h1>{name}</h1><p>{info}</p><pre>{pretty}</pre>")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("WEBX_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::default(),
    };

    let mut router = Router::new();
    router
        .get("/", handler_fn(|ctx| {
            Box::pin(async move {
                ctx.set("tmpl", "home");
                ctx.set("data", Data::new(json!({"name": "webx"})).with_info("it works"));
                Ok(())
            })
        }))
        .middleware(from_middleware(AutoOutput::default()));

    router.get("/hello/:name", handler_fn(|ctx| {
        Box::pin(async move {
            let greeting = format!("Hello, {}!", ctx.param("name"));
            ctx.string(StatusCode::Ok, greeting).await
        })
    }));

    router.get("/visits", handler_fn(|ctx| {
        Box::pin(async move {
            let visits = {
                let mut session = ctx.session()?;
                let n = session.get("visits").await.and_then(|v| v.as_u64()).unwrap_or(0) + 1;
                session.set("visits", n).await;
                n
            };
            ctx.json(StatusCode::Ok, &json!({ "visits": visits })).await
        })
    }));

    {
        let auth = BasicAuth::new(|user, pass| user == "admin" && pass == "secret");
        let mut admin = router.group("/admin", vec![from_middleware(auth)]);
        admin.get("/dashboard", handler_fn(|ctx| {
            Box::pin(async move { ctx.string(StatusCode::Ok, "welcome back").await })
        }));
    }

    let sessions = webx::session::middleware(config.session.clone())?;
    let app = App::builder()
        .config(config)
        .pre(from_middleware(TrailingSlash::remove()))
        .middleware(from_middleware(Logger))
        .middleware(from_middleware(MaxAllowed::new(256)))
        .middleware(from_middleware(Gzip::new()))
        .middleware(from_middleware(sessions))
        .renderer(Arc::new(DebugPage))
        .routes(router)
        .build()?;

    let server = webx::Server::bind(&app.config().address).await?;
    server.serve(Arc::new(app)).await?;
    Ok(())
}
