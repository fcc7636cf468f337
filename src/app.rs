//! The application: route table, middleware chains and the dispatch entry point.
//!
//! ```text
//! request ─▶ Pre-chain ─▶ route lookup ─▶ Use-chain (global, group, route) ─▶ handler
//!                              │
//!                              └─ 404 / 405 ─▶ Use-chain (global) ─▶ Err(HttpError)
//! any Err surfacing at the top ─▶ ErrorHandler (exactly once)
//! ```
//!
//! The route table sits behind an [`ArcSwap`]: every request loads one
//! complete table, and [`App::rebuild`] replaces it in a single store.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::Config;
use crate::context::Context;
use crate::engine::{self, BufferedResponse};
use crate::error::{Error, HttpError, Result};
use crate::http::{self, Method, StatusCode};
use crate::middleware::{BoxHandler, BoxMiddleware, Handler, chain};
use crate::render::{HttpErrorHandler, Renderer};
use crate::router::{RouteError, RouteMatch, RouteRef, RouteTable, Router};

/// Converts an error that reached the top of the chain into a response.
#[async_trait]
pub trait ErrorHandler: Send + Sync + 'static {
    async fn handle(&self, err: Error, ctx: &mut Context);
}

/// Builder for [`App`].
///
/// ```
/// use webx::{App, Router, StatusCode};
/// use webx::middleware::{Logger, from_middleware, handler_fn};
///
/// let mut router = Router::new();
/// router.get("/", handler_fn(|ctx| Box::pin(async move {
///     ctx.string(StatusCode::Ok, "home").await
/// })));
///
/// let app = App::builder()
///     .middleware(from_middleware(Logger))
///     .routes(router)
///     .build()
///     .unwrap();
/// assert_eq!(app.table().len(), 1);
/// ```
#[derive(Default)]
pub struct AppBuilder {
    config: Config,
    pre: Vec<BoxMiddleware>,
    middleware: Vec<BoxMiddleware>,
    routers: Vec<Router>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    renderer: Option<Arc<dyn Renderer>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Cancels requests that run longer than `timeout`.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Adds middleware that runs before routing, for every request.
    #[must_use]
    pub fn pre(mut self, middleware: BoxMiddleware) -> Self {
        self.pre.push(middleware);
        self
    }

    /// Adds middleware around every route, and around the 404/405 responses.
    #[must_use]
    pub fn middleware(mut self, middleware: BoxMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Adds a route set. Several sets are merged into one table.
    #[must_use]
    pub fn routes(mut self, router: Router) -> Self {
        self.routers.push(router);
        self
    }

    #[must_use]
    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Compiles the routes.
    ///
    /// # Errors
    ///
    /// Any [`RouteError`] from [`RouteTable::build`].
    pub fn build(self) -> Result<App, RouteError> {
        let table = Arc::new(ArcSwap::from_pointee(RouteTable::build(
            &self.routers,
            &self.middleware,
        )?));

        let endpoint = Arc::new(Endpoint {
            table: Arc::clone(&table),
            not_found: chain(&self.middleware, Arc::new(NotFound)),
            not_allowed: chain(&self.middleware, Arc::new(NotAllowed)),
        });
        let entry = chain(&self.pre, endpoint);

        let error_handler = self
            .error_handler
            .unwrap_or_else(|| {
                Arc::new(HttpErrorHandler::from_config(&self.config.render)) as Arc<dyn ErrorHandler>
            });

        Ok(App {
            table,
            global: self.middleware,
            entry,
            error_handler,
            renderer: ArcSwap::from_pointee(self.renderer),
            config: self.config,
        })
    }
}

/// A built application. Share it as `Arc<App>`.
pub struct App {
    table: Arc<ArcSwap<RouteTable>>,
    global: Vec<BoxMiddleware>,
    entry: BoxHandler,
    error_handler: Arc<dyn ErrorHandler>,
    renderer: ArcSwap<Option<Arc<dyn Renderer>>>,
    config: Config,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The route table requests are currently matched against.
    pub fn table(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Replaces the route table with one built from `routers`.
    ///
    /// Requests already in flight finish on the table they loaded. On error
    /// the current table stays active.
    ///
    /// # Errors
    ///
    /// Any [`RouteError`] from [`RouteTable::build`].
    pub fn rebuild<'a>(&self, routers: impl IntoIterator<Item = &'a Router>) -> Result<(), RouteError> {
        let table = RouteTable::build(routers, &self.global)?;
        debug!(routes = table.len(), "route table rebuilt");
        self.table.store(Arc::new(table));
        Ok(())
    }

    /// Reverse lookup against the current table; see [`RouteTable::uri`].
    pub fn uri<'a>(
        &self,
        target: impl Into<RouteRef<'a>>,
        params: &[(&str, &str)],
    ) -> Result<String, RouteError> {
        self.table.load().uri(target, params)
    }

    /// Replaces the renderer installed on new requests.
    pub fn set_renderer(&self, renderer: Arc<dyn Renderer>) {
        self.renderer.store(Arc::new(Some(renderer)));
    }

    /// Runs one request through the chains and hands the response back.
    ///
    /// Errors are converted by the [`ErrorHandler`]. Cancelling `token`, or
    /// exceeding the configured request timeout, turns every later response
    /// write into a no-op.
    pub async fn dispatch(
        &self,
        request: Box<dyn engine::Request>,
        response: Box<dyn engine::Response>,
        token: CancellationToken,
    ) -> Box<dyn engine::Response> {
        let mut ctx = Context::new(request, response);
        ctx.set_cancellation_token(token.clone());
        ctx.set_debug(self.config.debug);
        if let Some(renderer) = self.renderer.load().as_ref() {
            ctx.set_renderer(Arc::clone(renderer));
        }

        let deadline = (self.config.request_timeout_ms > 0).then(|| {
            let timeout = Duration::from_millis(self.config.request_timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        });

        if let Err(err) = self.entry.call(&mut ctx).await {
            self.error_handler.handle(err, &mut ctx).await;
        }

        if let Some(deadline) = deadline {
            deadline.abort();
        }
        ctx.into_response()
    }

    /// Serves a parsed HTTP/1.1 request with a [`BufferedResponse`].
    ///
    /// Returns `None` when the request was cancelled, in which case nothing
    /// should be written to the connection.
    pub async fn handle_http(&self, request: http::Request) -> Option<http::Response> {
        self.handle_http_with(request, CancellationToken::new()).await
    }

    /// Like [`handle_http`](Self::handle_http), with a token the engine
    /// cancels when the client goes away.
    pub async fn handle_http_with(
        &self,
        request: http::Request,
        token: CancellationToken,
    ) -> Option<http::Response> {
        let head_only = *request.method() == Method::Head;
        let keep_alive = request.is_keep_alive();

        let response = self
            .dispatch(
                Box::new(request),
                Box::new(BufferedResponse::new()),
                token.clone(),
            )
            .await;
        if token.is_cancelled() {
            debug!("request cancelled, dropping response");
            return None;
        }

        let wire = match response.into_any().downcast::<BufferedResponse>() {
            Ok(buffered) => buffered.finish(),
            Err(_) => Err(std::io::Error::other("response is not a BufferedResponse")),
        };
        let response = match wire {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "failed to finish response");
                return Some(http::Response::new(StatusCode::InternalServerError).keep_alive(false));
            }
        };
        Some(response.head_only(head_only).keep_alive(keep_alive))
    }
}

// Matches the request against the current table and runs the route's chain.
struct Endpoint {
    table: Arc<ArcSwap<RouteTable>>,
    not_found: BoxHandler,
    not_allowed: BoxHandler,
}

#[async_trait]
impl Handler for Endpoint {
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        let table = self.table.load_full();
        let handler = match table.find(ctx.method(), ctx.path()) {
            RouteMatch::Found { route, params } => {
                ctx.set_params(params);
                Arc::clone(route.handler())
            }
            RouteMatch::NotFound => Arc::clone(&self.not_found),
            RouteMatch::MethodNotAllowed { allowed } => {
                ctx.extensions_mut().insert(AllowedMethods(allowed));
                Arc::clone(&self.not_allowed)
            }
        };
        handler.call(ctx).await
    }
}

/// Methods registered for a path that did not match the request method.
/// Present in the context extensions while the 405 chain runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedMethods(pub Vec<Method>);

struct NotFound;

#[async_trait]
impl Handler for NotFound {
    async fn call(&self, _ctx: &mut Context) -> Result<()> {
        Err(HttpError::new(StatusCode::NotFound).into())
    }
}

struct NotAllowed;

#[async_trait]
impl Handler for NotAllowed {
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        let allow = ctx
            .extensions()
            .get::<AllowedMethods>()
            .map(|AllowedMethods(methods)| {
                methods
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        ctx.set_header("Allow", allow)?;
        Err(HttpError::new(StatusCode::MethodNotAllowed).into())
    }
}
