//! # webx
//!
//! An async HTTP dispatch core: a radix-tree router, composable middleware,
//! a per-request [`Context`], sessions, content negotiation and a small
//! HTTP/1.1 engine to run it all on.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webx::middleware::{Logger, from_middleware, handler_fn};
//! use webx::server::Server;
//! use webx::{App, Router, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/hello/:name", handler_fn(|ctx| Box::pin(async move {
//!         let greeting = format!("Hello, {}!", ctx.param("name"));
//!         ctx.string(StatusCode::Ok, greeting).await
//!     })));
//!
//!     let app = App::builder()
//!         .middleware(from_middleware(Logger))
//!         .routes(router)
//!         .build()?;
//!     Server::bind("127.0.0.1:8080").await?.serve(Arc::new(app)).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod http;
pub mod middleware;
pub mod render;
pub mod router;
pub mod security;
pub mod server;
pub mod session;

pub use app::{App, AppBuilder, ErrorHandler};
pub use config::{Config, ConfigError};
pub use context::Context;
pub use error::{Error, HttpError, Result};
pub use http::{Headers, Method, StatusCode};
pub use router::{RouteError, Router};
pub use server::{Server, ServerError};
