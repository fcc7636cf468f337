//! Capability adapters between a transport engine and the framework core.
//!
//! The core only talks to the traits in this module, so any transport that
//! implements them can drive an [`App`](crate::App). Capabilities that not
//! every engine has are split out:
//!
//! - [`Request`] / [`Response`]: mandatory header, URL, method and body access.
//! - [`Hijack`]: take over the raw connection (protocol upgrades).
//! - [`BodyWriter`]: replace the body sink, e.g. to compress on the fly.
//!
//! An engine lacking an optional capability reports
//! [`Error::NotSupported`](crate::Error::NotSupported) instead of panicking.
//!
//! The built-in adapters are the parsed HTTP/1.1 [`http::Request`](crate::http::Request)
//! and [`BufferedResponse`], which the [`server`](crate::server) serialises once
//! the request finishes.

use std::any::Any;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use crate::error::{Error, HttpError, Result};
use crate::http::{self, Headers, Method, StatusCode};

/// Read side of a request, as the core sees it.
pub trait Request: Send + Sync + 'static {
    fn method(&self) -> &Method;
    fn set_method(&mut self, method: Method);

    /// Percent-decoded path without the query string.
    fn path(&self) -> &str;
    /// Replaces the path with an already decoded one.
    fn set_path(&mut self, path: &str);

    /// Path as received, still percent-encoded.
    fn raw_path(&self) -> &str;

    /// Raw path plus `?query`, as received.
    fn uri(&self) -> String;
    /// Replaces path and query from an encoded request-target. Fails with
    /// `400 Bad Request` when the decoded path is not UTF-8.
    fn set_uri(&mut self, uri: &str) -> Result<()>;

    /// Raw query string without `?`, empty when absent.
    fn query_string(&self) -> &str;

    fn header(&self, name: &str) -> Option<&str>;
    fn headers(&self) -> &Headers;
    fn host(&self) -> &str;
    fn scheme(&self) -> &str;
    fn is_tls(&self) -> bool;

    /// First decoded query parameter named `key`.
    fn query(&self, key: &str) -> Option<&str>;
    /// First decoded form field named `key`.
    fn form(&self, key: &str) -> Option<&str>;

    fn body(&self) -> &[u8];
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// The hijack capability, when the engine has one.
    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        None
    }
}

/// A raw bidirectional connection handed out by [`Hijack`].
pub trait RawConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RawConnection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Optional capability: detach the underlying connection from the engine.
pub trait Hijack: Send {
    fn hijack(&mut self) -> Result<Box<dyn RawConnection>>;
}

/// Replacement body sink installed through [`Response::set_writer`].
pub trait BodyWriter: Send {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Flushes the sink and returns the bytes that go on the wire.
    fn finish(self: Box<Self>) -> io::Result<Vec<u8>>;
}

/// Write side of a request.
pub trait Response: Send + 'static {
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;

    /// Commits status and headers. A second call is ignored.
    fn write_header(&mut self, status: StatusCode);

    /// Appends body bytes, committing with `200 OK` first if needed.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    fn status(&self) -> StatusCode;

    /// Body bytes written so far, before any body writer transformation.
    fn size(&self) -> usize;

    fn committed(&self) -> bool;

    /// Optional capability: route body bytes through `writer`.
    fn set_writer(&mut self, writer: Box<dyn BodyWriter>) -> Result<()> {
        drop(writer);
        Err(Error::NotSupported("body writer replacement"))
    }

    /// Uninstalls the writer set with [`set_writer`](Self::set_writer), as
    /// long as no body byte went through it yet.
    fn reset_writer(&mut self) -> Option<Box<dyn BodyWriter>> {
        None
    }

    /// Lets the engine that created the response take it back.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl Request for http::Request {
    fn method(&self) -> &Method {
        http::Request::method(self)
    }

    fn set_method(&mut self, method: Method) {
        http::Request::set_method(self, method);
    }

    fn path(&self) -> &str {
        http::Request::path(self)
    }

    fn set_path(&mut self, path: &str) {
        http::Request::set_path(self, path);
    }

    fn raw_path(&self) -> &str {
        http::Request::raw_path(self)
    }

    fn uri(&self) -> String {
        http::Request::uri(self)
    }

    fn set_uri(&mut self, uri: &str) -> Result<()> {
        http::Request::set_uri(self, uri).map_err(|e| {
            Error::from(HttpError::new(StatusCode::BadRequest).with_message(e.to_string()))
        })
    }

    fn query_string(&self) -> &str {
        http::Request::query_string(self).unwrap_or_default()
    }

    fn header(&self, name: &str) -> Option<&str> {
        http::Request::headers(self).get(name)
    }

    fn headers(&self) -> &Headers {
        http::Request::headers(self)
    }

    fn host(&self) -> &str {
        http::Request::host(self)
    }

    fn scheme(&self) -> &str {
        http::Request::scheme(self)
    }

    fn is_tls(&self) -> bool {
        http::Request::is_tls(self)
    }

    fn query(&self, key: &str) -> Option<&str> {
        self.query_param(key)
    }

    fn form(&self, key: &str) -> Option<&str> {
        self.form_param(key)
    }

    fn body(&self) -> &[u8] {
        http::Request::body(self)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        http::Request::remote_addr(self)
    }
}

/// In-memory response used by the built-in TCP engine and by tests.
///
/// The body is held until [`finish`](Self::finish) so that Content-Length is
/// known and a replacement [`BodyWriter`] can post-process it.
pub struct BufferedResponse {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    size: usize,
    committed: bool,
    writer: Option<Box<dyn BodyWriter>>,
}

impl Default for BufferedResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Headers::new(),
            body: Vec::new(),
            size: 0,
            committed: false,
            writer: None,
        }
    }

    /// Body written so far. With a body writer installed this stays empty
    /// until [`finish`](Self::finish).
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Drains the body writer and produces the wire response.
    pub fn finish(mut self) -> io::Result<http::Response> {
        if let Some(writer) = self.writer.take() {
            self.body = writer.finish()?;
        }
        Ok(http::Response::from_parts(
            self.status,
            self.headers,
            self.body,
        ))
    }
}

impl Response for BufferedResponse {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.committed {
            warn!(
                current = self.status.as_u16(),
                attempted = status.as_u16(),
                "response already committed"
            );
            return;
        }
        self.status = status;
        self.committed = true;
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if !self.committed {
            self.write_header(StatusCode::Ok);
        }
        match self.writer.as_mut() {
            Some(writer) => writer.write(bytes)?,
            None => self.body.extend_from_slice(bytes),
        }
        self.size += bytes.len();
        Ok(bytes.len())
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn size(&self) -> usize {
        self.size
    }

    fn committed(&self) -> bool {
        self.committed
    }

    fn set_writer(&mut self, writer: Box<dyn BodyWriter>) -> Result<()> {
        if self.size > 0 {
            return Err(Error::Committed);
        }
        self.writer = Some(writer);
        Ok(())
    }

    fn reset_writer(&mut self) -> Option<Box<dyn BodyWriter>> {
        if self.size > 0 {
            return None;
        }
        self.writer.take()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper(Vec<u8>);

    impl BodyWriter for Upper {
        fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
            self.0.extend(chunk.iter().map(u8::to_ascii_uppercase));
            Ok(())
        }

        fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
            Ok(self.0)
        }
    }

    #[test]
    fn write_commits_with_ok() {
        let mut res = BufferedResponse::new();
        assert!(!res.committed());
        res.write(b"hi").unwrap();
        assert!(res.committed());
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.size(), 2);
    }

    #[test]
    fn second_write_header_is_ignored() {
        let mut res = BufferedResponse::new();
        res.write_header(StatusCode::Created);
        res.write_header(StatusCode::InternalServerError);
        assert_eq!(res.status(), StatusCode::Created);
    }

    #[test]
    fn body_writer_transforms_output() {
        let mut res = BufferedResponse::new();
        res.set_writer(Box::new(Upper(Vec::new()))).unwrap();
        res.write(b"abc").unwrap();
        let wire = res.finish().unwrap();
        assert_eq!(wire.body_ref(), b"ABC");
    }

    #[test]
    fn body_writer_rejected_after_body_started() {
        let mut res = BufferedResponse::new();
        res.write(b"x").unwrap();
        assert!(matches!(
            res.set_writer(Box::new(Upper(Vec::new()))),
            Err(Error::Committed)
        ));
    }

    #[test]
    fn unused_body_writer_can_be_reset() {
        let mut res = BufferedResponse::new();
        res.set_writer(Box::new(Upper(Vec::new()))).unwrap();
        assert!(res.reset_writer().is_some());
        res.write(b"abc").unwrap();
        assert_eq!(res.finish().unwrap().body_ref(), b"abc");
    }

    #[test]
    fn undecodable_uri_maps_to_bad_request() {
        let (mut req, _) = http::Request::parse(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let err = Request::set_uri(&mut req, "/%FF").unwrap_err();
        assert_eq!(err.as_http().unwrap().code(), StatusCode::BadRequest);
    }

    #[test]
    fn parsed_request_has_no_hijack_capability() {
        let (mut req, _) = http::Request::parse(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert!(Request::hijacker(&mut req).is_none());
    }
}
