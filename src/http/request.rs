//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::net::SocketAddr;

use bytes::Bytes;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },

    #[error("request path is not valid UTF-8 once percent-decoded")]
    InvalidPath,
}

// Characters re-escaped when a decoded path is written back into a URI.
const PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer. The path is
/// percent-decoded with `percent-encoding`, while [`uri`](Self::uri) keeps the
/// form that arrived on the wire. Query parameters and urlencoded form bodies
/// are decoded with `serde_urlencoded`.
///
/// ```
/// use webx::http::request::Request;
///
/// let raw = b"GET /hello?name=w%C3%B6rld HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("wörld"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    /// Percent-decoded path, used for routing and parameters.
    path: String,
    /// Path exactly as received.
    raw_path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    query_params: Vec<(String, String)>,
    form_params: Option<Vec<(String, String)>>,
    remote_addr: Option<SocketAddr>,
    tls: bool,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body
    /// begins in `buf`. Everything after that offset is taken as the body.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the headers.
    /// - [`RequestError::Parse`]: the data is malformed.
    /// - [`RequestError::MissingField`]: method, path or version is absent.
    /// - [`RequestError::InvalidPath`]: the decoded path is not UTF-8.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let mut request = Self {
            method,
            path: String::new(),
            raw_path: String::new(),
            version,
            headers: header_map,
            query: None,
            body: Bytes::copy_from_slice(&buf[body_offset..]),
            query_params: Vec::new(),
            form_params: None,
            remote_addr: None,
            tls: false,
        };
        request.set_uri(raw_path)?;
        request.form_params = request.parse_form();

        Ok((request, body_offset))
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Replaces the method, used by method-override middleware.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Returns the percent-decoded request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the path as it arrived, still percent-encoded.
    pub fn raw_path(&self) -> &str {
        &self.raw_path
    }

    /// Rewrites the path, keeping the current query string.
    ///
    /// `path` is taken as already decoded; the raw form is re-encoded from it.
    pub fn set_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.raw_path = utf8_percent_encode(&path, PATH).to_string();
        self.path = path;
    }

    /// Returns the raw path plus `?query` when a query string is present.
    pub fn uri(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{q}", self.raw_path),
            _ => self.raw_path.clone(),
        }
    }

    /// Replaces path and query from a request-target such as `/a/b?x=1`.
    ///
    /// # Errors
    ///
    /// [`RequestError::InvalidPath`] when the decoded path is not UTF-8. The
    /// request is left unchanged in that case.
    pub fn set_uri(&mut self, uri: &str) -> Result<(), RequestError> {
        let (raw_path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query.to_owned())),
            None => (uri, None),
        };
        let path = percent_decode_str(raw_path)
            .decode_utf8()
            .map_err(|_| RequestError::InvalidPath)?
            .into_owned();
        self.query_params = query.as_deref().map(decode_pairs).unwrap_or_default();
        self.path = path;
        self.raw_path = raw_path.to_owned();
        self.query = query;
        Ok(())
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the first decoded query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        lookup(&self.query_params, key)
    }

    /// Returns the first decoded form field from a urlencoded body.
    pub fn form_param(&self, key: &str) -> Option<&str> {
        self.form_params.as_deref().and_then(|p| lookup(p, key))
    }

    /// Returns the request body, trimmed to `Content-Length` by the server.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Value of the `Host` header, empty when missing.
    pub fn host(&self) -> &str {
        self.headers.get("host").unwrap_or_default()
    }

    /// Returns the peer address, when the engine knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Records the peer address for this request.
    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    /// Returns `true` if the request arrived over TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Marks the request as having arrived over TLS (set by a terminating proxy
    /// integration or a TLS-aware engine).
    pub fn set_tls(&mut self, tls: bool) {
        self.tls = tls;
    }

    /// `https` when TLS or `X-Forwarded-Proto: https`, otherwise `http`.
    pub fn scheme(&self) -> &'static str {
        let forwarded = self
            .headers
            .get("x-forwarded-proto")
            .is_some_and(|p| p.eq_ignore_ascii_case("https"));
        if self.tls || forwarded { "https" } else { "http" }
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }

    /// Trims the body to `len` bytes once the connection loop knows the framing.
    pub(crate) fn truncate_body(&mut self, len: usize) {
        if self.body.len() > len {
            self.body.truncate(len);
            self.form_params = self.parse_form();
        }
    }

    fn parse_form(&self) -> Option<Vec<(String, String)>> {
        let is_form = self.headers.get("content-type").is_some_and(|ct| {
            ct.to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        });
        if !is_form {
            return None;
        }
        std::str::from_utf8(&self.body).ok().map(decode_pairs)
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

// Malformed escapes fall back to the raw pairs split on `&` and `=`.
fn decode_pairs(raw: &str) -> Vec<(String, String)> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(raw).unwrap_or_else(|_| {
        raw.split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                (k.replace('+', " "), v.replace('+', " "))
            })
            .collect()
    })
}
