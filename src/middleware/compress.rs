//! Gzip response compression.

use std::io::{self, Write};

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use super::{Middleware, Next, Skipper, default_skipper};
use crate::context::Context;
use crate::engine::BodyWriter;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct GzipConfig {
    pub skipper: Skipper,
    /// Compression level, 0 to 9.
    pub level: u32,
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            skipper: default_skipper(),
            level: Compression::default().level(),
        }
    }
}

struct GzipWriter {
    encoder: GzEncoder<Vec<u8>>,
}

impl BodyWriter for GzipWriter {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.encoder.write_all(chunk)
    }

    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        self.encoder.finish()
    }
}

/// Compresses response bodies for clients that send
/// `Accept-Encoding: gzip`.
///
/// `Vary: Accept-Encoding` is always added. When the downstream chain writes
/// no body (redirects, `204`, `HEAD`), the encoding is backed out so the
/// response carries neither `Content-Encoding` nor an empty gzip stream.
/// Engines without body writer support serve uncompressed.
#[derive(Default)]
pub struct Gzip {
    config: GzipConfig,
}

impl Gzip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: GzipConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Middleware for Gzip {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if (self.config.skipper)(ctx) {
            return next.run(ctx).await;
        }
        ctx.add_header("Vary", "Accept-Encoding")?;
        if !ctx.header("accept-encoding").contains("gzip") {
            return next.run(ctx).await;
        }

        let writer = GzipWriter {
            encoder: GzEncoder::new(Vec::new(), Compression::new(self.config.level.min(9))),
        };
        match ctx.response_mut().set_writer(Box::new(writer)) {
            Ok(()) => {}
            Err(Error::NotSupported(what)) => {
                debug!(capability = what, "engine cannot compress, serving identity");
                return next.run(ctx).await;
            }
            Err(err) => return Err(err),
        }
        ctx.set_header("Content-Encoding", "gzip")?;

        let result = next.run(ctx).await;

        let response = ctx.response_mut();
        if response.size() == 0 && response.reset_writer().is_some() {
            response.headers_mut().remove("content-encoding");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BufferedResponse;
    use crate::http::StatusCode;
    use crate::middleware::tests::context_with;
    use crate::middleware::{BoxHandler, chain, from_middleware, handler_fn};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn finish(ctx: Context) -> crate::http::Response {
        ctx.into_response()
            .into_any()
            .downcast::<BufferedResponse>()
            .unwrap()
            .finish()
            .unwrap()
    }

    fn text() -> BoxHandler {
        handler_fn(|ctx| {
            Box::pin(async move { ctx.string(StatusCode::Ok, "hello ".repeat(50)).await })
        })
    }

    async fn run(handler: BoxHandler, headers: &str) -> crate::http::Response {
        let mut ctx = context_with("GET", "/", headers);
        chain(&[from_middleware(Gzip::new())], handler)
            .call(&mut ctx)
            .await
            .unwrap();
        finish(ctx)
    }

    #[tokio::test]
    async fn compresses_when_accepted() {
        let wire = run(text(), "Accept-Encoding: gzip, deflate\r\n").await;
        assert_eq!(wire.headers().get("content-encoding"), Some("gzip"));
        assert_eq!(wire.headers().get("vary"), Some("Accept-Encoding"));

        let mut plain = String::new();
        GzDecoder::new(wire.body_ref())
            .read_to_string(&mut plain)
            .unwrap();
        assert_eq!(plain, "hello ".repeat(50));
    }

    #[tokio::test]
    async fn identity_when_not_accepted() {
        let wire = run(text(), "").await;
        assert!(wire.headers().get("content-encoding").is_none());
        assert_eq!(wire.headers().get("vary"), Some("Accept-Encoding"));
        assert_eq!(wire.body_ref(), "hello ".repeat(50).as_bytes());
    }

    #[tokio::test]
    async fn empty_body_backs_out_the_encoding() {
        let empty = handler_fn(|ctx| Box::pin(async move { ctx.no_content(StatusCode::NoContent).await }));
        let wire = run(empty, "Accept-Encoding: gzip\r\n").await;
        assert!(wire.headers().get("content-encoding").is_none());
        assert!(wire.body_ref().is_empty());
    }
}
