//! HTTP Basic authentication.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use super::{Middleware, Next, Skipper, default_skipper};
use crate::context::Context;
use crate::error::Result;
use crate::http::StatusCode;

/// Decides whether a user/password pair is accepted.
pub type BasicValidator = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Requires valid `Authorization: Basic` credentials.
///
/// Missing, malformed or rejected credentials end the request with
/// `401 Unauthorized` and a `WWW-Authenticate` challenge.
///
/// ```rust
/// use webx::middleware::BasicAuth;
///
/// let auth = BasicAuth::new(|user, pass| user == "admin" && pass == "secret");
/// ```
pub struct BasicAuth {
    validator: BasicValidator,
    realm: String,
    skipper: Skipper,
}

impl BasicAuth {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
            realm: "Restricted".to_owned(),
            skipper: default_skipper(),
        }
    }

    #[must_use]
    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    #[must_use]
    pub fn skipper(mut self, skipper: Skipper) -> Self {
        self.skipper = skipper;
        self
    }

    fn accepts(&self, authorization: &str) -> bool {
        let Some(encoded) = authorization
            .split_once(' ')
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("basic"))
            .map(|(_, rest)| rest.trim())
        else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded) else {
            debug!("basic credentials are not valid base64");
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        decoded
            .split_once(':')
            .is_some_and(|(user, password)| (self.validator)(user, password))
    }
}

#[async_trait]
impl Middleware for BasicAuth {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if (self.skipper)(ctx) {
            return next.run(ctx).await;
        }
        if self.accepts(ctx.header("authorization")) {
            return next.run(ctx).await;
        }
        ctx.set_header("WWW-Authenticate", format!("Basic realm={}", self.realm))?;
        Err(StatusCode::Unauthorized.into())
    }
}
