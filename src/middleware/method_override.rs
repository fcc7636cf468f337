//! HTTP method override for clients that can only send GET and POST.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Middleware, Next, Skipper, default_skipper};
use crate::context::Context;
use crate::error::Result;
use crate::http::Method;

/// Extracts the requested method from a request; empty means "no override".
pub type MethodGetter = Arc<dyn Fn(&Context) -> String + Send + Sync>;

/// Reads the override from request header `name`.
pub fn method_from_header(name: impl Into<String>) -> MethodGetter {
    let name = name.into();
    Arc::new(move |ctx: &Context| ctx.header(&name).to_owned())
}

/// Reads the override from form field `param`.
pub fn method_from_form(param: impl Into<String>) -> MethodGetter {
    let param = param.into();
    Arc::new(move |ctx: &Context| ctx.form(&param).to_owned())
}

/// Reads the override from query parameter `param`.
pub fn method_from_query(param: impl Into<String>) -> MethodGetter {
    let param = param.into();
    Arc::new(move |ctx: &Context| ctx.query(&param).to_owned())
}

#[derive(Clone)]
pub struct MethodOverrideConfig {
    pub skipper: Skipper,
    /// Defaults to the `X-HTTP-Method-Override` header.
    pub getter: MethodGetter,
}

impl Default for MethodOverrideConfig {
    fn default() -> Self {
        Self {
            skipper: default_skipper(),
            getter: method_from_header("X-HTTP-Method-Override"),
        }
    }
}

/// Replaces the method of a `POST` request with the one its getter reports.
/// Other methods are never overridden. Install it before routing.
#[derive(Default)]
pub struct MethodOverride {
    config: MethodOverrideConfig,
}

impl MethodOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MethodOverrideConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Middleware for MethodOverride {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if (self.config.skipper)(ctx) || *ctx.method() != Method::Post {
            return next.run(ctx).await;
        }
        let requested = (self.config.getter)(ctx);
        if !requested.is_empty() {
            let Ok(method) = requested.parse::<Method>();
            debug!(method = %method, "method overridden");
            ctx.request_mut().set_method(method);
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BufferedResponse;
    use crate::http::{Request, StatusCode};
    use crate::middleware::tests::{body_of, context_with};
    use crate::middleware::{chain, from_middleware, handler_fn};

    async fn seen_method(mw: MethodOverride, mut ctx: Context) -> String {
        let echo = handler_fn(|ctx| {
            Box::pin(async move {
                let method = ctx.method().to_string();
                ctx.string(StatusCode::Ok, method).await
            })
        });
        chain(&[from_middleware(mw)], echo).call(&mut ctx).await.unwrap();
        body_of(ctx).1
    }

    #[tokio::test]
    async fn header_overrides_post() {
        let ctx = context_with("POST", "/items/1", "X-HTTP-Method-Override: delete\r\n");
        assert_eq!(seen_method(MethodOverride::new(), ctx).await, "DELETE");
    }

    #[tokio::test]
    async fn non_post_is_left_alone() {
        let ctx = context_with("GET", "/items/1", "X-HTTP-Method-Override: DELETE\r\n");
        assert_eq!(seen_method(MethodOverride::new(), ctx).await, "GET");
    }

    #[tokio::test]
    async fn form_and_query_getters() {
        let body = "_method=PUT";
        let raw = format!(
            "POST /items HTTP/1.1\r\nHost: h\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        let ctx = Context::new(Box::new(req), Box::new(BufferedResponse::new()));
        let mw = MethodOverride::with_config(MethodOverrideConfig {
            getter: method_from_form("_method"),
            ..Default::default()
        });
        assert_eq!(seen_method(mw, ctx).await, "PUT");

        let ctx = context_with("POST", "/items?_method=PATCH", "");
        let mw = MethodOverride::with_config(MethodOverrideConfig {
            getter: method_from_query("_method"),
            ..Default::default()
        });
        assert_eq!(seen_method(mw, ctx).await, "PATCH");
    }

    #[tokio::test]
    async fn missing_override_keeps_post() {
        let ctx = context_with("POST", "/items", "");
        assert_eq!(seen_method(MethodOverride::new(), ctx).await, "POST");
    }
}
