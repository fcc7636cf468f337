//! Handlers, middleware and the chain builder.
//!
//! A [`Middleware`] receives the per-request [`Context`] and a [`Next`]
//! pointing at the rest of the chain. It may:
//!
//! - **pass through**: `next.run(ctx).await` and return the result unchanged;
//! - **post-process**: call `next`, then inspect or adjust the context;
//! - **short-circuit**: return its own `Ok`/`Err` without calling `next`;
//! - **wrap**: call `next` and map the error it returns.
//!
//! [`chain`] folds `[M1, M2, …, Mn]` around a terminal handler `H` into
//! `M1(M2(…Mn(H)…))`: `M1` sees the request first and the outcome last.
//! Composition happens once, when the route table is built, not per request.
//!
//! ```rust,no_run
//! use webx::middleware::{chain, handler_fn, middleware_fn};
//!
//! let timing = middleware_fn(|ctx, next| {
//!     Box::pin(async move {
//!         let res = next.run(ctx).await;
//!         tracing::debug!(path = %ctx.path(), "handled");
//!         res
//!     })
//! });
//! let hello = handler_fn(|ctx| Box::pin(async move {
//!     ctx.string(webx::StatusCode::Ok, "hello").await
//! }));
//! let composed = chain(&[timing], hello);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::context::Context;
use crate::error::Result;

pub mod auth;
pub mod compress;
pub mod funcmap;
pub mod limit;
pub mod method_override;
pub mod redirect;
pub mod slash;
pub mod validate;

pub use auth::BasicAuth;
pub use compress::{Gzip, GzipConfig};
pub use funcmap::FuncMap;
pub use limit::MaxAllowed;
pub use method_override::{MethodOverride, MethodOverrideConfig};
pub use redirect::{Redirect, RedirectConfig};
pub use slash::{TrailingSlash, TrailingSlashConfig};
pub use validate::Validate;

/// Boxed future returned by closure handlers and middleware.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Terminal request handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: &mut Context) -> Result<()>;
}

/// Shared, type-erased handler. Its pointer identity is what
/// [`RouteTable::uri`](crate::router::RouteTable::uri) looks routes up by.
pub type BoxHandler = Arc<dyn Handler>;

/// Things a router accepts as a handler.
pub trait IntoHandler {
    fn into_handler(self) -> BoxHandler;
}

impl IntoHandler for BoxHandler {
    fn into_handler(self) -> BoxHandler {
        self
    }
}

impl<H: Handler> IntoHandler for H {
    fn into_handler(self) -> BoxHandler {
        Arc::new(self)
    }
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Turns an async closure into a [`BoxHandler`].
pub fn handler_fn<F>(f: F) -> BoxHandler
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Arc::new(HandlerFn(f))
}

/// The remainder of the chain after the current middleware.
///
/// Consumed by [`run`](Self::run), so a middleware calls through at most once.
#[derive(Clone)]
pub struct Next {
    handler: BoxHandler,
}

impl Next {
    pub fn new(handler: BoxHandler) -> Self {
        Self { handler }
    }

    pub async fn run(self, ctx: &mut Context) -> Result<()> {
        self.handler.call(ctx).await
    }
}

/// A handler wrapper. See the module docs for what an implementation may do.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()>;
}

pub type BoxMiddleware = Arc<dyn Middleware>;

struct MiddlewareFn<F>(F);

#[async_trait]
impl<F> Middleware for MiddlewareFn<F>
where
    F: for<'a> Fn(&'a mut Context, Next) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        (self.0)(ctx, next).await
    }
}

/// Turns an async closure into a [`BoxMiddleware`].
pub fn middleware_fn<F>(f: F) -> BoxMiddleware
where
    F: for<'a> Fn(&'a mut Context, Next) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Arc::new(MiddlewareFn(f))
}

/// Boxes a concrete middleware.
pub fn from_middleware<M: Middleware>(middleware: M) -> BoxMiddleware {
    Arc::new(middleware)
}

// One layer of the onion: `middleware` around `next`.
struct Wrapped {
    middleware: BoxMiddleware,
    next: BoxHandler,
}

#[async_trait]
impl Handler for Wrapped {
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        let next = Next::new(Arc::clone(&self.next));
        self.middleware.handle(ctx, next).await
    }
}

/// Composes `middleware` around `handler`; the first element is outermost.
pub fn chain(middleware: &[BoxMiddleware], handler: BoxHandler) -> BoxHandler {
    middleware.iter().rev().fold(handler, |next, mw| {
        Arc::new(Wrapped {
            middleware: Arc::clone(mw),
            next,
        }) as BoxHandler
    })
}

/// Predicate that makes a middleware step aside for a request.
///
/// When it returns `true` the middleware does no work and delegates
/// straight to `next`.
pub type Skipper = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// The skipper every middleware starts with: never skip.
pub fn default_skipper() -> Skipper {
    Arc::new(|_| false)
}

/// Logs method, path, status and elapsed time once the downstream chain returns.
///
/// Errors are logged with the status the error handler is expected to pick
/// and passed on untouched.
#[derive(Default)]
pub struct Logger;

#[async_trait]
impl Middleware for Logger {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        let start = Instant::now();
        let method = ctx.method().to_string();
        let path = ctx.path().to_owned();

        let result = next.run(ctx).await;

        let duration = start.elapsed();
        match &result {
            Ok(()) => {
                let status = ctx.response().status().as_u16();
                info!("{} {} - {} ({:?})", method, path, status, duration);
            }
            Err(err) => {
                warn!(error = %err, "{} {} - failed ({:?})", method, path, duration);
            }
        }
        result
    }
}
