//! Cross-origin resource sharing.

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::http::{Method, StatusCode};
use crate::middleware::{Middleware, Next, Skipper, default_skipper};

/// CORS middleware: validates `Origin`, answers preflight requests and adds
/// `Access-Control-*` headers to actual responses.
///
/// - Without an `Origin` header, or with an origin outside the allow-list,
///   the request passes through unmodified.
/// - `OPTIONS` preflight requests are answered with `204 No Content`; the
///   downstream handler is not called.
/// - Other requests get the CORS headers before the handler runs, so they
///   are present whichever writer commits the response.
/// - A specific (non-wildcard) origin is echoed back with `Vary: Origin`.
///
/// ```rust
/// use webx::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Custom-Header");
/// ```
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    allow_credentials: bool,
    max_age: u32,
    skipper: Skipper,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// Permissive defaults:
    ///
    /// | Setting          | Default value                          |
    /// |------------------|----------------------------------------|
    /// | Allowed origins  | `*` (all origins)                      |
    /// | Allowed methods  | `GET`, `POST`, `PUT`, `DELETE`         |
    /// | Allowed headers  | `Content-Type`, `Authorization`        |
    /// | Preflight max age| 3600 seconds                           |
    pub fn new() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE"].map(String::from).to_vec(),
            allowed_headers: ["Content-Type", "Authorization"].map(String::from).to_vec(),
            allow_credentials: false,
            max_age: 3600,
            skipper: default_skipper(),
        }
    }

    /// Restricts origins to exactly `origins`, dropping the default `*`.
    #[must_use]
    pub fn origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an allowed origin. `"*"` accepts every origin.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// Sends `Access-Control-Allow-Credentials: true`. The origin is then
    /// always echoed back instead of `*`.
    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self
    }

    #[must_use]
    pub fn skipper(mut self, skipper: Skipper) -> Self {
        self.skipper = skipper;
        self
    }

    fn allowed_origin(&self, origin: &str) -> Option<String> {
        let wildcard = self.allowed_origins.iter().any(|o| o == "*");
        if wildcard && !self.allow_credentials {
            Some("*".to_owned())
        } else if wildcard || self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if (self.skipper)(ctx) {
            return next.run(ctx).await;
        }
        let origin = ctx.header("origin").to_owned();
        if origin.is_empty() {
            return next.run(ctx).await;
        }
        let Some(allow_origin) = self.allowed_origin(&origin) else {
            return next.run(ctx).await;
        };

        ctx.set_header("Access-Control-Allow-Origin", allow_origin.as_str())?;
        ctx.set_header("Access-Control-Allow-Methods", self.allowed_methods.join(", "))?;
        ctx.set_header("Access-Control-Allow-Headers", self.allowed_headers.join(", "))?;
        if self.allow_credentials {
            ctx.set_header("Access-Control-Allow-Credentials", "true")?;
        }
        if allow_origin != "*" {
            ctx.add_header("Vary", "Origin")?;
        }

        if *ctx.method() == Method::Options {
            ctx.set_header("Access-Control-Max-Age", self.max_age.to_string())?;
            return ctx.no_content(StatusCode::NoContent).await;
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::tests::{body_of, context_with};
    use crate::middleware::{chain, from_middleware, handler_fn};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn run(cors: CorsMiddleware, method: &str, headers: &str) -> (Context, bool) {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let handler = handler_fn(move |ctx| {
            let flag = Arc::clone(&flag);
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                ctx.string(StatusCode::Ok, "data").await
            })
        });
        let mut ctx = context_with(method, "/api", headers);
        chain(&[from_middleware(cors)], handler)
            .call(&mut ctx)
            .await
            .unwrap();
        (ctx, called.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn wildcard_origin_on_actual_request() {
        let (ctx, called) = run(CorsMiddleware::new(), "GET", "Origin: https://a.test\r\n").await;
        assert!(called);
        let headers = ctx.response().headers();
        assert_eq!(headers.get("access-control-allow-origin"), Some("*"));
        assert!(headers.get("vary").is_none());
        assert_eq!(body_of(ctx).1, "data");
    }

    #[tokio::test]
    async fn preflight_short_circuits() {
        let cors = CorsMiddleware::new().origins(["https://a.test"]);
        let (ctx, called) = run(cors, "OPTIONS", "Origin: https://a.test\r\n").await;
        assert!(!called);
        let headers = ctx.response().headers();
        assert_eq!(headers.get("access-control-allow-origin"), Some("https://a.test"));
        assert_eq!(headers.get("access-control-max-age"), Some("3600"));
        assert_eq!(headers.get("vary"), Some("Origin"));
        assert_eq!(body_of(ctx).0, StatusCode::NoContent);
    }

    #[tokio::test]
    async fn unknown_origin_passes_through_untouched() {
        let cors = CorsMiddleware::new().origins(["https://a.test"]);
        let (ctx, called) = run(cors, "GET", "Origin: https://evil.test\r\n").await;
        assert!(called);
        assert!(ctx.response().headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn credentials_echo_the_origin() {
        let cors = CorsMiddleware::new().allow_credentials(true);
        let (ctx, _) = run(cors, "GET", "Origin: https://a.test\r\n").await;
        let headers = ctx.response().headers();
        assert_eq!(headers.get("access-control-allow-origin"), Some("https://a.test"));
        assert_eq!(headers.get("access-control-allow-credentials"), Some("true"));
    }

    #[tokio::test]
    async fn skipper_disables_the_policy() {
        let cors = CorsMiddleware::new().skipper(Arc::new(|ctx: &Context| ctx.path() == "/api"));
        let (ctx, called) = run(cors, "OPTIONS", "Origin: https://a.test\r\n").await;
        assert!(called);
        assert!(ctx.response().headers().get("access-control-allow-origin").is_none());
    }
}
