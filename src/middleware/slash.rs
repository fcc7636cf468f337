//! Trailing-slash normalisation.
//!
//! Run these as pre-routing middleware: rewriting the path only changes which
//! route matches when it happens before the lookup.

use async_trait::async_trait;

use super::{Middleware, Next, Skipper, default_skipper};
use crate::context::Context;
use crate::error::Result;
use crate::http::StatusCode;

#[derive(Clone)]
pub struct TrailingSlashConfig {
    pub skipper: Skipper,
    /// Answer with a redirect using this status instead of rewriting the
    /// request in place.
    pub redirect_code: Option<StatusCode>,
}

impl Default for TrailingSlashConfig {
    fn default() -> Self {
        Self {
            skipper: default_skipper(),
            redirect_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Add,
    Remove,
}

/// Adds or strips the trailing `/` of the request path. The root path `/`
/// is left alone and the query string is preserved.
pub struct TrailingSlash {
    mode: Mode,
    config: TrailingSlashConfig,
}

impl TrailingSlash {
    pub fn add() -> Self {
        Self::add_with_config(TrailingSlashConfig::default())
    }

    pub fn add_with_config(config: TrailingSlashConfig) -> Self {
        Self { mode: Mode::Add, config }
    }

    pub fn remove() -> Self {
        Self::remove_with_config(TrailingSlashConfig::default())
    }

    pub fn remove_with_config(config: TrailingSlashConfig) -> Self {
        Self { mode: Mode::Remove, config }
    }

    fn rewrite(&self, path: &str) -> Option<String> {
        if path == "/" {
            return None;
        }
        match self.mode {
            Mode::Add if !path.ends_with('/') => Some(format!("{path}/")),
            Mode::Remove if path.ends_with('/') => {
                let trimmed = path.trim_end_matches('/');
                Some(if trimmed.is_empty() { "/" } else { trimmed }.to_owned())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Middleware for TrailingSlash {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if (self.config.skipper)(ctx) {
            return next.run(ctx).await;
        }
        let Some(path) = self.rewrite(ctx.request().raw_path()) else {
            return next.run(ctx).await;
        };
        let query = ctx.request().query_string();
        let uri = if query.is_empty() {
            path
        } else {
            format!("{path}?{query}")
        };

        if let Some(code) = self.config.redirect_code {
            return ctx.redirect(code, &uri).await;
        }
        ctx.request_mut().set_uri(&uri)?;
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::tests::{body_of, context};
    use crate::middleware::{chain, from_middleware, handler_fn};

    fn echo_uri() -> crate::middleware::BoxHandler {
        handler_fn(|ctx| {
            Box::pin(async move {
                let uri = ctx.uri();
                ctx.string(StatusCode::Ok, uri).await
            })
        })
    }

    async fn run(mw: TrailingSlash, target: &str) -> Context {
        let mut ctx = context("GET", target);
        chain(&[from_middleware(mw)], echo_uri())
            .call(&mut ctx)
            .await
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn add_rewrites_in_place_and_keeps_query() {
        let ctx = run(TrailingSlash::add(), "/users?page=2").await;
        assert_eq!(ctx.query("page"), "2");
        assert_eq!(body_of(ctx).1, "/users/?page=2");
    }

    #[tokio::test]
    async fn remove_strips_every_trailing_slash() {
        let ctx = run(TrailingSlash::remove(), "/users//").await;
        assert_eq!(body_of(ctx).1, "/users");
    }

    #[tokio::test]
    async fn root_is_untouched() {
        let ctx = run(TrailingSlash::remove(), "/").await;
        assert_eq!(body_of(ctx).1, "/");
        let ctx = run(TrailingSlash::add(), "/").await;
        assert_eq!(body_of(ctx).1, "/");
    }

    #[tokio::test]
    async fn redirect_mode_answers_with_location() {
        let config = TrailingSlashConfig {
            redirect_code: Some(StatusCode::MovedPermanently),
            ..Default::default()
        };
        let ctx = run(TrailingSlash::add_with_config(config), "/docs?x=1").await;
        assert_eq!(ctx.response().headers().get("location"), Some("/docs/?x=1"));
        assert_eq!(body_of(ctx).0, StatusCode::MovedPermanently);
    }
}
