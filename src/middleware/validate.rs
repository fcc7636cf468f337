//! Installs a request validator.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Middleware, Next, Skipper, default_skipper};
use crate::context::{Context, Validator};
use crate::error::Result;

type Generator = Arc<dyn Fn() -> Arc<dyn Validator> + Send + Sync>;

/// Gives every request a validator from `generator`, used by
/// [`Context::validate`].
pub struct Validate {
    generator: Generator,
    skipper: Skipper,
}

impl Validate {
    pub fn new<F>(generator: F) -> Self
    where
        F: Fn() -> Arc<dyn Validator> + Send + Sync + 'static,
    {
        Self {
            generator: Arc::new(generator),
            skipper: default_skipper(),
        }
    }

    /// Shares one validator across all requests.
    pub fn shared(validator: Arc<dyn Validator>) -> Self {
        Self::new(move || Arc::clone(&validator))
    }

    #[must_use]
    pub fn skipper(mut self, skipper: Skipper) -> Self {
        self.skipper = skipper;
        self
    }
}

#[async_trait]
impl Middleware for Validate {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if !(self.skipper)(ctx) {
            ctx.set_validator((self.generator)());
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpError;
    use crate::http::StatusCode;
    use crate::middleware::tests::context;
    use crate::middleware::{chain, from_middleware, handler_fn};
    use serde::Serialize;
    use serde_json::Value;

    struct RequireName;

    impl Validator for RequireName {
        fn validate(&self, value: &Value) -> Result<()> {
            match value.get("name").and_then(Value::as_str) {
                Some(name) if !name.is_empty() => Ok(()),
                _ => Err(HttpError::new(StatusCode::UnprocessableEntity)
                    .with_message("name is required")
                    .into()),
            }
        }
    }

    #[derive(Serialize)]
    struct Signup {
        name: String,
    }

    fn checks_signup() -> crate::middleware::BoxHandler {
        handler_fn(|ctx| {
            Box::pin(async move {
                ctx.validate(&Signup { name: String::new() })?;
                ctx.string(StatusCode::Ok, "valid").await
            })
        })
    }

    #[tokio::test]
    async fn installed_validator_rejects_bad_input() {
        let mw = Validate::shared(Arc::new(RequireName));
        let mut ctx = context("POST", "/signup");
        let err = chain(&[from_middleware(mw)], checks_signup())
            .call(&mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.as_http().unwrap().message(), "name is required");
    }

    #[tokio::test]
    async fn skipped_request_has_no_validator() {
        let mw = Validate::new(|| Arc::new(RequireName)).skipper(Arc::new(|_: &Context| true));
        let mut ctx = context("POST", "/signup");
        chain(&[from_middleware(mw)], checks_signup())
            .call(&mut ctx)
            .await
            .unwrap();
    }
}
