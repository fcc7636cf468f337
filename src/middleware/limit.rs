//! Admission control.

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use super::{Middleware, Next, Skipper, default_skipper};
use crate::context::Context;
use crate::error::{Error, Result};

/// Lets at most `n` requests into the wrapped chain at once; the rest wait.
///
/// The slot is held by a semaphore permit for the duration of the
/// downstream call and released when the permit drops, so error returns and
/// panics release it too.
pub struct MaxAllowed {
    slots: Semaphore,
    skipper: Skipper,
}

impl MaxAllowed {
    pub fn new(n: usize) -> Self {
        Self {
            slots: Semaphore::new(n),
            skipper: default_skipper(),
        }
    }

    #[must_use]
    pub fn skipper(mut self, skipper: Skipper) -> Self {
        self.skipper = skipper;
        self
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

#[async_trait]
impl Middleware for MaxAllowed {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if (self.skipper)(ctx) {
            return next.run(ctx).await;
        }
        if self.slots.available_permits() == 0 {
            debug!(path = %ctx.path(), "all slots busy, waiting");
        }
        let _permit = self.slots.acquire().await.map_err(Error::other)?;
        next.run(ctx).await
    }
}
