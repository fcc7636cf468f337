//! Scheme and host canonicalisation redirects.

use async_trait::async_trait;

use super::{Middleware, Next, Skipper, default_skipper};
use crate::context::Context;
use crate::error::Result;
use crate::http::StatusCode;

#[derive(Clone)]
pub struct RedirectConfig {
    pub skipper: Skipper,
    /// Status used for every redirect. Defaults to `301 Moved Permanently`.
    pub code: StatusCode,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            skipper: default_skipper(),
            code: StatusCode::MovedPermanently,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Https,
    HttpsWww,
    Www,
    NonWww,
}

const WWW: &str = "www.";

/// Redirects requests onto a canonical scheme or host, keeping the
/// request URI. Requests already in canonical form pass through.
///
/// ```rust
/// use webx::middleware::{Redirect, RedirectConfig};
/// use webx::StatusCode;
///
/// let to_https = Redirect::https();
/// let to_www = Redirect::www_with_config(RedirectConfig {
///     code: StatusCode::Found,
///     ..Default::default()
/// });
/// ```
pub struct Redirect {
    kind: Kind,
    config: RedirectConfig,
}

impl Redirect {
    /// `http://host/uri` to `https://host/uri`.
    pub fn https() -> Self {
        Self::https_with_config(RedirectConfig::default())
    }

    pub fn https_with_config(config: RedirectConfig) -> Self {
        Self { kind: Kind::Https, config }
    }

    /// To `https://www.host/uri` unless already on TLS with a `www.` host.
    pub fn https_www() -> Self {
        Self::https_www_with_config(RedirectConfig::default())
    }

    pub fn https_www_with_config(config: RedirectConfig) -> Self {
        Self { kind: Kind::HttpsWww, config }
    }

    /// `scheme://host/uri` to `scheme://www.host/uri`.
    pub fn www() -> Self {
        Self::www_with_config(RedirectConfig::default())
    }

    pub fn www_with_config(config: RedirectConfig) -> Self {
        Self { kind: Kind::Www, config }
    }

    /// `scheme://www.host/uri` to `scheme://host/uri`.
    pub fn non_www() -> Self {
        Self::non_www_with_config(RedirectConfig::default())
    }

    pub fn non_www_with_config(config: RedirectConfig) -> Self {
        Self { kind: Kind::NonWww, config }
    }

    fn target(&self, ctx: &Context) -> Option<String> {
        let host = ctx.host();
        let uri = ctx.uri();
        let has_www = host.starts_with(WWW);
        match self.kind {
            Kind::Https if !ctx.is_tls() => Some(format!("https://{host}{uri}")),
            Kind::HttpsWww if !ctx.is_tls() || !has_www => {
                let bare = host.strip_prefix(WWW).unwrap_or(host);
                Some(format!("https://{WWW}{bare}{uri}"))
            }
            Kind::Www if !has_www => Some(format!("{}://{WWW}{host}{uri}", ctx.scheme())),
            Kind::NonWww if has_www => Some(format!("{}://{}{uri}", ctx.scheme(), &host[WWW.len()..])),
            _ => None,
        }
    }
}

#[async_trait]
impl Middleware for Redirect {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if (self.config.skipper)(ctx) {
            return next.run(ctx).await;
        }
        match self.target(ctx) {
            Some(url) => ctx.redirect(self.config.code, &url).await,
            None => next.run(ctx).await,
        }
    }
}
