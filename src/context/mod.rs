//! Per-request context: request access, route parameters, the handler to
//! renderer data store, session, renderer, validator and response writers.
//!
//! A [`Context`] is created by [`App::dispatch`](crate::App::dispatch) for
//! each request and dropped when the response has been handed back to the
//! engine. It is owned by the task serving the request and never shared.
//!
//! Response writers (`string`, `json`, `render`, …) commit the response. A
//! second commit is refused with [`Error::Committed`] and logged; once the
//! request's [`CancellationToken`] fires, writers become silent no-ops.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{self, RawConnection};
use crate::error::{Error, HttpError, Result};
use crate::http::{Method, StatusCode};
use crate::middleware::BoxFuture;
use crate::render::{Data, Renderer, xml};
use crate::session::{Session, SessionError, SessionHandle};

/// Type-erased request extensions, keyed by type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Inserts a value, returning the previous one of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Route parameters in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

/// A value in the context data store.
#[derive(Debug, Clone, PartialEq)]
pub enum Stored {
    Value(Value),
    /// A labelled payload; the output dispatcher unwraps it for templates.
    Data(Data),
}

impl Stored {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Data(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    /// The JSON form used by the JSON, JSONP and XML encoders.
    pub fn to_json(&self) -> Result<Value> {
        match self {
            Self::Value(v) => Ok(v.clone()),
            Self::Data(d) => Ok(serde_json::to_value(d)?),
        }
    }
}

impl From<Value> for Stored {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Data> for Stored {
    fn from(data: Data) -> Self {
        Self::Data(data)
    }
}

impl From<&str> for Stored {
    fn from(s: &str) -> Self {
        Self::Value(Value::from(s))
    }
}

impl From<String> for Stored {
    fn from(s: String) -> Self {
        Self::Value(Value::from(s))
    }
}

/// A function exposed to the renderer's template namespace. It sees the
/// context as it is when the template calls it.
pub type TemplateFn = Arc<dyn Fn(&Context, &[Value]) -> Value + Send + Sync>;

/// Template functions registered for the current request.
pub type TemplateFuncs = BTreeMap<String, TemplateFn>;

/// Checks a bound value before a handler uses it.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, value: &Value) -> Result<()>;
}

type PreResponseHook =
    Box<dyn for<'a> FnOnce(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send>;

/// Per-request state. See the module docs.
pub struct Context {
    request: Box<dyn engine::Request>,
    response: Box<dyn engine::Response>,
    params: Params,
    store: HashMap<String, Stored>,
    extensions: Extensions,
    funcs: TemplateFuncs,
    session: Option<Session>,
    renderer: Option<Arc<dyn Renderer>>,
    validator: Option<Arc<dyn Validator>>,
    hooks: Vec<PreResponseHook>,
    code: Option<StatusCode>,
    cancel: CancellationToken,
    debug: bool,
}

impl Context {
    pub fn new(request: Box<dyn engine::Request>, response: Box<dyn engine::Response>) -> Self {
        Self {
            request,
            response,
            params: Params::new(),
            store: HashMap::new(),
            extensions: Extensions::new(),
            funcs: TemplateFuncs::new(),
            session: None,
            renderer: None,
            validator: None,
            hooks: Vec::new(),
            code: None,
            cancel: CancellationToken::new(),
            debug: false,
        }
    }

    /// Hands the response back to the engine.
    pub fn into_response(self) -> Box<dyn engine::Response> {
        self.response
    }

    // ── request ──────────────────────────────────────────────────────────

    pub fn request(&self) -> &dyn engine::Request {
        self.request.as_ref()
    }

    pub fn request_mut(&mut self) -> &mut dyn engine::Request {
        self.request.as_mut()
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path(&self) -> &str {
        self.request.path()
    }

    pub fn uri(&self) -> String {
        self.request.uri()
    }

    pub fn host(&self) -> &str {
        self.request.host()
    }

    pub fn scheme(&self) -> &str {
        self.request.scheme()
    }

    pub fn is_tls(&self) -> bool {
        self.request.is_tls()
    }

    pub fn body(&self) -> &[u8] {
        self.request.body()
    }

    /// Request header value, empty when absent.
    pub fn header(&self, name: &str) -> &str {
        self.request.header(name).unwrap_or_default()
    }

    /// Decoded query parameter, empty when absent.
    pub fn query(&self, key: &str) -> &str {
        self.request.query(key).unwrap_or_default()
    }

    /// Decoded urlencoded form field, empty when absent.
    pub fn form(&self, key: &str) -> &str {
        self.request.form(key).unwrap_or_default()
    }

    /// Bound route parameter, empty when absent.
    pub fn param(&self, name: &str) -> &str {
        self.params.get(name).unwrap_or_default()
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.names()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    /// Deserialises the request body by content type: JSON, urlencoded form,
    /// or the query string when the request has neither.
    ///
    /// # Errors
    ///
    /// A `400 Bad Request` [`HttpError`] describing the decode failure.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T> {
        let content_type = self.header("content-type").to_ascii_lowercase();
        let bad_request =
            |e: &dyn std::fmt::Display| HttpError::new(StatusCode::BadRequest).with_message(e.to_string());

        if content_type.starts_with("application/json") {
            serde_json::from_slice(self.body()).map_err(|e| bad_request(&e).into())
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            serde_urlencoded::from_bytes(self.body()).map_err(|e| bad_request(&e).into())
        } else {
            serde_urlencoded::from_str(self.request.query_string())
                .map_err(|e| bad_request(&e).into())
        }
    }

    /// Negotiated output format: `json`, `jsonp`, `xml` or `html`.
    ///
    /// A non-empty `format` query parameter wins. Otherwise the first media
    /// type in `Accept` (by quality, then order) that maps to a format is
    /// used, falling back to `html`.
    pub fn format(&self) -> String {
        let explicit = self.query("format");
        if !explicit.is_empty() {
            return explicit.to_ascii_lowercase();
        }
        negotiate(self.header("accept")).to_owned()
    }

    /// Takes over the raw connection.
    ///
    /// # Errors
    ///
    /// [`Error::NotSupported`] when the engine has no hijack capability.
    pub fn hijack(&mut self) -> Result<Box<dyn RawConnection>> {
        match self.request.hijacker() {
            Some(hijacker) => hijacker.hijack(),
            None => Err(Error::NotSupported("connection hijacking")),
        }
    }

    // ── data store ───────────────────────────────────────────────────────

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Stored>) {
        self.store.insert(key.into(), value.into());
    }

    /// Serialises `value` and stores it under `key`.
    pub fn set_json<T: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Stored> {
        self.store.get(key)
    }

    /// Every stored entry, in no particular order.
    pub fn stored(&self) -> impl Iterator<Item = (&str, &Stored)> {
        self.store.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Deserialises the value under `key`; `Ok(None)` when the key is unset.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key) {
            Some(stored) => Ok(Some(serde_json::from_value(stored.to_json()?)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&mut self, key: &str) -> Option<Stored> {
        self.store.remove(key)
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Registers a template function for this request only.
    pub fn set_func<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.funcs
            .insert(name.into(), Arc::new(move |_: &Context, args: &[Value]| f(args)));
    }

    pub fn set_func_arc(&mut self, name: impl Into<String>, f: TemplateFn) {
        self.funcs.insert(name.into(), f);
    }

    pub fn funcs(&self) -> &TemplateFuncs {
        &self.funcs
    }

    /// Calls a registered template function.
    pub fn call_func(&self, name: &str, args: &[Value]) -> Option<Value> {
        self.funcs.get(name).map(|f| f(self, args))
    }

    /// Status used by the output dispatcher and [`render`](Self::render).
    pub fn code(&self) -> StatusCode {
        self.code.unwrap_or(StatusCode::Ok)
    }

    pub fn set_code(&mut self, code: StatusCode) {
        self.code = Some(code);
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    // ── session, renderer, validator ─────────────────────────────────────

    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// The request's session. Loading from the store happens on first access.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConfigured`] when no session middleware ran.
    /// Values of the session if it has been loaded, without touching the store.
    pub fn session_values(&self) -> Option<&Map<String, Value>> {
        self.session.as_ref().and_then(Session::values)
    }

    pub fn session(&mut self) -> Result<SessionHandle<'_>> {
        let session = self
            .session
            .as_mut()
            .ok_or(Error::Session(SessionError::NotConfigured))?;
        Ok(SessionHandle::new(
            session,
            self.request.as_ref(),
            self.response.as_mut(),
        ))
    }

    pub fn renderer(&self) -> Option<&Arc<dyn Renderer>> {
        self.renderer.as_ref()
    }

    pub fn set_renderer(&mut self, renderer: Arc<dyn Renderer>) {
        self.renderer = Some(renderer);
    }

    pub fn set_validator(&mut self, validator: Arc<dyn Validator>) {
        self.validator = Some(validator);
    }

    /// Runs the installed validator; passes when none is installed.
    pub fn validate<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        match &self.validator {
            Some(validator) => validator.validate(&serde_json::to_value(value)?),
            None => Ok(()),
        }
    }

    // ── cancellation ─────────────────────────────────────────────────────

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ── response ─────────────────────────────────────────────────────────

    pub fn response(&self) -> &dyn engine::Response {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> &mut dyn engine::Response {
        self.response.as_mut()
    }

    pub fn committed(&self) -> bool {
        self.response.committed()
    }

    /// Replaces a response header.
    ///
    /// # Errors
    ///
    /// [`Error::Committed`] once the status line has been written.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.guard_headers(name)?;
        self.response.headers_mut().set(name, value);
        Ok(())
    }

    /// Appends a response header.
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.guard_headers(name)?;
        self.response.headers_mut().insert(name, value);
        Ok(())
    }

    fn guard_headers(&self, name: &str) -> Result<()> {
        if self.response.committed() {
            warn!(header = name, "header set after the response was committed");
            return Err(Error::Committed);
        }
        Ok(())
    }

    /// Registers `hook` to run once, right before the response commits.
    ///
    /// Hook errors are logged and do not stop the commit.
    pub fn add_pre_response_hook<F>(&mut self, hook: F)
    where
        F: for<'a> FnOnce(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    // Returns `Ok(false)` when the request was cancelled and nothing should be written.
    async fn begin(&mut self, code: StatusCode, content_type: Option<&str>) -> Result<bool> {
        if self.cancel.is_cancelled() {
            debug!(status = code.as_u16(), "request cancelled, response write skipped");
            return Ok(false);
        }
        if self.response.committed() {
            warn!(
                status = code.as_u16(),
                committed = self.response.status().as_u16(),
                "response already committed"
            );
            return Err(Error::Committed);
        }

        for hook in std::mem::take(&mut self.hooks) {
            if let Err(err) = hook(self).await {
                warn!(error = %err, "pre-response hook failed");
            }
        }
        if self.response.committed() {
            warn!("a pre-response hook committed the response");
            return Err(Error::Committed);
        }

        if let Some(content_type) = content_type {
            self.response.headers_mut().set("Content-Type", content_type);
        }
        self.response.write_header(code);
        Ok(true)
    }

    /// Commits `code` and writes `body` with `content_type`.
    pub async fn blob(&mut self, code: StatusCode, content_type: &str, body: &[u8]) -> Result<()> {
        if self.begin(code, Some(content_type)).await? {
            self.response.write(body)?;
        }
        Ok(())
    }

    pub async fn string(&mut self, code: StatusCode, body: impl AsRef<str>) -> Result<()> {
        self.blob(code, "text/plain; charset=utf-8", body.as_ref().as_bytes())
            .await
    }

    pub async fn html(&mut self, code: StatusCode, body: impl AsRef<str>) -> Result<()> {
        self.blob(code, "text/html; charset=utf-8", body.as_ref().as_bytes())
            .await
    }

    pub async fn json<T: Serialize + ?Sized>(&mut self, code: StatusCode, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.blob(code, "application/json", &body).await
    }

    /// JSON wrapped in `callback(...)`. An empty callback degrades to plain JSON.
    ///
    /// # Errors
    ///
    /// `400 Bad Request` when the callback is not a JavaScript identifier path.
    pub async fn jsonp<T: Serialize + ?Sized>(
        &mut self,
        code: StatusCode,
        callback: &str,
        value: &T,
    ) -> Result<()> {
        if callback.is_empty() {
            return self.json(code, value).await;
        }
        if !is_valid_callback(callback) {
            return Err(HttpError::new(StatusCode::BadRequest)
                .with_message("invalid jsonp callback")
                .into());
        }
        let json = serde_json::to_string(value)?;
        let body = format!("{callback}({json});");
        self.blob(code, "application/javascript; charset=utf-8", body.as_bytes())
            .await
    }

    pub async fn xml<T: Serialize + ?Sized>(&mut self, code: StatusCode, value: &T) -> Result<()> {
        let body = xml::encode(&serde_json::to_value(value)?);
        self.blob(code, "application/xml; charset=utf-8", body.as_bytes())
            .await
    }

    /// Commits `code` without a body.
    pub async fn no_content(&mut self, code: StatusCode) -> Result<()> {
        self.begin(code, None).await?;
        Ok(())
    }

    /// Redirects to `url`.
    ///
    /// # Errors
    ///
    /// `500` when `code` is not a redirection status.
    pub async fn redirect(&mut self, code: StatusCode, url: &str) -> Result<()> {
        if !code.is_redirection() {
            return Err(HttpError::new(StatusCode::InternalServerError)
                .with_message(format!("invalid redirect status {}", code.as_u16()))
                .into());
        }
        self.set_header("Location", url)?;
        self.no_content(code).await
    }

    /// Renders template `name` with `data` through the current renderer,
    /// committing [`code`](Self::code).
    pub async fn render(&mut self, name: &str, data: &Value) -> Result<()> {
        let renderer = self
            .renderer
            .clone()
            .ok_or_else(|| Error::Render("no renderer configured".to_owned()))?;
        let mut body = Vec::new();
        renderer.render(&mut body, name, data, self)?;
        let code = self.code();
        self.blob(code, renderer.content_type(), &body).await
    }
}

fn is_valid_callback(callback: &str) -> bool {
    callback
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.' | '[' | ']'))
}

fn negotiate(accept: &str) -> &'static str {
    let mut ranges: Vec<(&str, f32)> = accept
        .split(',')
        .filter_map(|range| {
            let mut parts = range.split(';');
            let media = parts.next()?.trim();
            let quality = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            // q=0 marks the range as not acceptable.
            (!media.is_empty() && quality > 0.0).then_some((media, quality))
        })
        .collect();
    ranges.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (media, _) in ranges {
        let media = media.to_ascii_lowercase();
        let format = match media.as_str() {
            "text/html" | "application/xhtml+xml" => "html",
            m if m.ends_with("/json") || m.ends_with("+json") => "json",
            m if m.ends_with("/xml") || m.ends_with("+xml") => "xml",
            m if m.ends_with("/javascript") => "jsonp",
            _ => continue,
        };
        return format;
    }
    "html"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::tests::{body_of, context, context_with};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn param_is_empty_when_unbound() {
        let mut ctx = context("GET", "/users/42");
        ctx.set_params([("id".to_owned(), "42".to_owned())].into_iter().collect());
        assert_eq!(ctx.param("id"), "42");
        assert_eq!(ctx.param("missing"), "");
        assert_eq!(ctx.param_names().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn store_is_last_write_wins() {
        let mut ctx = context("GET", "/");
        ctx.set("k", json!(1));
        ctx.set("k", "two");
        assert_eq!(ctx.get("k").and_then(Stored::as_str), Some("two"));
        assert_eq!(ctx.get_as::<String>("k").unwrap().as_deref(), Some("two"));
        assert!(ctx.delete("k").is_some());
        assert!(ctx.get("k").is_none());
        assert_eq!(ctx.get_as::<String>("k").unwrap(), None);
    }

    #[test]
    fn extensions_are_typed() {
        let mut ctx = context("GET", "/");
        #[derive(Debug, PartialEq)]
        struct UserId(u32);
        ctx.extensions_mut().insert(UserId(7));
        assert_eq!(ctx.extensions().get::<UserId>(), Some(&UserId(7)));
        assert_eq!(ctx.extensions_mut().remove::<UserId>(), Some(UserId(7)));
    }

    #[test]
    fn format_query_overrides_accept() {
        let ctx = context_with("GET", "/?format=XML", "Accept: application/json\r\n");
        assert_eq!(ctx.format(), "xml");
    }

    #[test]
    fn format_sniffs_accept() {
        let cases = [
            ("application/json", "json"),
            ("text/javascript, application/javascript, */*;q=0.01", "jsonp"),
            ("text/xml", "xml"),
            ("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8", "html"),
            ("application/xml;q=0.5, application/json", "json"),
            ("*/*", "html"),
            ("application/json;q=0, text/csv", "html"),
            ("application/json; q=0.0, text/xml;q=0.2", "xml"),
        ];
        for (accept, want) in cases {
            let ctx = context_with("GET", "/", &format!("Accept: {accept}\r\n"));
            assert_eq!(ctx.format(), want, "Accept: {accept}");
        }
        assert_eq!(context("GET", "/").format(), "html");
    }

    #[tokio::test]
    async fn json_writes_exact_body_and_content_type() {
        let mut ctx = context("GET", "/");
        ctx.json(StatusCode::Ok, &json!({"Name": "Webx"})).await.unwrap();
        assert_eq!(
            ctx.response().headers().get("content-type"),
            Some("application/json")
        );
        let (status, body) = body_of(ctx);
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(body, r#"{"Name":"Webx"}"#);
    }

    #[tokio::test]
    async fn second_commit_is_refused() {
        let mut ctx = context("GET", "/");
        ctx.string(StatusCode::Created, "first").await.unwrap();
        let err = ctx.string(StatusCode::InternalServerError, "second").await;
        assert!(matches!(err, Err(Error::Committed)));
        assert!(matches!(ctx.set_header("X-Late", "1"), Err(Error::Committed)));

        let (status, body) = body_of(ctx);
        assert_eq!(status, StatusCode::Created);
        assert_eq!(body, "first");
    }

    #[tokio::test]
    async fn pre_response_hooks_run_once_before_commit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut ctx = context("GET", "/");
        let counter = Arc::clone(&runs);
        ctx.add_pre_response_hook(move |ctx| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                assert!(!ctx.committed());
                ctx.set_header("X-Hooked", "yes")
            })
        });

        ctx.no_content(StatusCode::NoContent).await.unwrap();
        let _ = ctx.no_content(StatusCode::NoContent).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.response().headers().get("x-hooked"), Some("yes"));
    }

    #[tokio::test]
    async fn cancelled_request_ignores_writes() {
        let mut ctx = context("GET", "/");
        ctx.cancellation_token().cancel();
        ctx.string(StatusCode::Ok, "lost").await.unwrap();
        assert!(!ctx.committed());
    }

    #[tokio::test]
    async fn jsonp_wraps_and_validates_callback() {
        let mut ctx = context("GET", "/");
        ctx.jsonp(StatusCode::Ok, "cb", &json!([1])).await.unwrap();
        assert_eq!(body_of(ctx).1, "cb([1]);");

        let mut ctx = context("GET", "/");
        ctx.jsonp(StatusCode::Ok, "", &json!([1])).await.unwrap();
        assert_eq!(body_of(ctx).1, "[1]");

        let mut ctx = context("GET", "/");
        let err = ctx
            .jsonp(StatusCode::Ok, "alert(1)//", &json!([1]))
            .await
            .unwrap_err();
        assert_eq!(err.as_http().unwrap().code(), StatusCode::BadRequest);
        assert!(!ctx.committed());
    }

    #[tokio::test]
    async fn redirect_sets_location() {
        let mut ctx = context("GET", "/old");
        ctx.redirect(StatusCode::MovedPermanently, "/new").await.unwrap();
        assert_eq!(ctx.response().headers().get("location"), Some("/new"));
        assert_eq!(ctx.response().status(), StatusCode::MovedPermanently);

        let mut ctx = context("GET", "/old");
        assert!(ctx.redirect(StatusCode::Ok, "/new").await.is_err());
    }

    #[tokio::test]
    async fn render_without_renderer_is_a_render_error() {
        let mut ctx = context("GET", "/");
        let err = ctx.render("index", &Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::Render(_)));
    }

    #[test]
    fn bind_json_form_and_query() {
        #[derive(Deserialize)]
        struct Login {
            user: String,
        }

        let raw = b"POST / HTTP/1.1\r\nHost: h\r\nContent-Type: application/json\r\nContent-Length: 14\r\n\r\n{\"user\":\"ann\"}";
        let (req, _) = crate::http::Request::parse(raw).unwrap();
        let ctx = Context::new(Box::new(req), Box::new(engine::BufferedResponse::new()));
        assert_eq!(ctx.bind::<Login>().unwrap().user, "ann");

        let ctx = context_with(
            "POST",
            "/",
            "Content-Type: application/x-www-form-urlencoded\r\n",
        );
        assert!(ctx.bind::<Login>().is_err());

        let ctx = context("GET", "/?user=bob");
        assert_eq!(ctx.bind::<Login>().unwrap().user, "bob");
    }

    #[test]
    fn template_funcs_are_per_context() {
        let mut ctx = context("GET", "/");
        ctx.set_func("double", |args: &[Value]| {
            json!(args.first().and_then(Value::as_i64).unwrap_or(0) * 2)
        });
        assert_eq!(ctx.call_func("double", &[json!(21)]), Some(json!(42)));
        assert!(context("GET", "/").call_func("double", &[]).is_none());
    }

    #[test]
    fn hijack_is_not_supported_by_the_parsed_request() {
        let mut ctx = context("GET", "/ws");
        assert!(matches!(ctx.hijack(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn session_requires_middleware() {
        let mut ctx = context("GET", "/");
        assert!(matches!(
            ctx.session(),
            Err(Error::Session(SessionError::NotConfigured))
        ));
    }
}
