//! Sessions with lazy loading and at-most-once persistence.
//!
//! Each request gets a [`Session`] in one of three states:
//!
//! ```text
//! Unloaded ──first access──▶ Loaded ──mutation──▶ Dirty
//!                              ▲                    │
//!                              └──── save ok ───────┘   (save error: stays Dirty)
//! ```
//!
//! - Nothing touches the [`Store`] until the session is read or written.
//! - Only a `Dirty` session is saved, and a successful save makes it `Loaded`
//!   again, so a second [`save`](SessionHandle::save) is a no-op.
//! - A failing [`Store::get`] is logged and replaced by a fresh session; it
//!   never fails the request.
//!
//! The [`Sessions`] middleware saves at two points: right before the response
//! commits (client-side stores, and new server-side sessions, whose cookie must
//! go out with the headers), and always after the handler returns, error or not.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::context::Context;
use crate::engine::{Request, Response};
use crate::error::Result;
use crate::middleware::{Middleware, Next};

pub mod codec;
pub mod cookie;
pub mod keyed;

pub use codec::{KeyPair, SecureCodec};
pub use cookie::CookieStore;
pub use keyed::{Backend, FileBackend, FileStore, KeyedStore, MemoryBackend, MemoryStore};

pub(crate) const FLASH_KEY: &str = "_flash";

/// Session failures. None of them fail a request on their own.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session middleware installed")]
    NotConfigured,

    #[error("session cookie signature is invalid")]
    InvalidSignature,

    #[error("session cookie is malformed: {0}")]
    Malformed(String),

    #[error("session has expired")]
    Expired,

    #[error("encoded session is {size} bytes, over the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("session codec: {0}")]
    Codec(&'static str),

    #[error("response already committed, session cookie not sent")]
    HeadersCommitted,

    #[error("unknown session engine {0:?}")]
    UnknownEngine(String),

    #[error("session store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("session record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session cookie attributes and store selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// `cookie`, `memory` or `file`; see [`middleware`].
    pub engine: String,
    pub name: String,
    pub path: String,
    pub domain: String,
    /// Seconds. `0` makes a browser-session cookie, negative deletes the session.
    pub max_age: i64,
    pub secure: bool,
    pub http_only: bool,
    /// Directory for the `file` engine.
    pub dir: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            engine: "cookie".to_owned(),
            name: "SID".to_owned(),
            path: "/".to_owned(),
            domain: String::new(),
            max_age: 30 * 24 * 60 * 60,
            secure: false,
            http_only: true,
            dir: None,
        }
    }
}

/// What a [`Store`] loads and saves.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Opaque id; empty until a server-side store assigns one.
    pub id: String,
    pub name: String,
    pub values: Map<String, Value>,
    /// Not yet persisted.
    pub is_new: bool,
    pub options: SessionOptions,
}

impl SessionRecord {
    pub fn new(name: &str, options: SessionOptions) -> Self {
        Self {
            id: String::new(),
            name: name.to_owned(),
            values: Map::new(),
            is_new: true,
            options,
        }
    }
}

/// Pluggable session persistence.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Loads the session `name` for `request`, or a new record when the
    /// request carries none.
    async fn get(&self, request: &dyn Request, name: &str) -> Result<SessionRecord, SessionError>;

    /// Persists `record` and sets whatever cookie the client needs.
    async fn save(
        &self,
        request: &dyn Request,
        response: &mut dyn Response,
        record: &mut SessionRecord,
    ) -> Result<(), SessionError>;

    /// Default options for records this store creates.
    fn configure(&self, options: &SessionOptions);

    /// Whether the whole session travels in the cookie.
    fn client_side(&self) -> bool {
        false
    }
}

/// Observable load state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loaded,
    Dirty,
}

/// One request's session. Use it through [`Context::session`].
///
/// `record` is `None` while unloaded; `dirty` marks unsaved changes.
pub struct Session {
    name: String,
    store: Arc<dyn Store>,
    options: SessionOptions,
    record: Option<SessionRecord>,
    dirty: bool,
}

impl Session {
    pub fn new(store: Arc<dyn Store>, options: SessionOptions) -> Self {
        Self {
            name: options.name.clone(),
            store,
            options,
            record: None,
            dirty: false,
        }
    }

    pub fn state(&self) -> SessionState {
        match (&self.record, self.dirty) {
            (None, _) => SessionState::Unloaded,
            (Some(_), false) => SessionState::Loaded,
            (Some(_), true) => SessionState::Dirty,
        }
    }

    /// Values of the loaded session, `None` while unloaded.
    pub fn values(&self) -> Option<&Map<String, Value>> {
        self.record.as_ref().map(|r| &r.values)
    }

    async fn record(&mut self, request: &dyn Request) -> &mut SessionRecord {
        let record = match self.record.take() {
            Some(record) => record,
            None => match self.store.get(request, &self.name).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(session = %self.name, error = %err, "session load failed, starting a new one");
                    SessionRecord::new(&self.name, self.options.clone())
                }
            },
        };
        self.record.insert(record)
    }

    async fn record_mut(&mut self, request: &dyn Request) -> &mut SessionRecord {
        self.dirty = true;
        self.record(request).await
    }
}

/// A [`Session`] together with the request and response it belongs to.
pub struct SessionHandle<'a> {
    session: &'a mut Session,
    request: &'a dyn Request,
    response: &'a mut dyn Response,
}

impl<'a> SessionHandle<'a> {
    pub(crate) fn new(
        session: &'a mut Session,
        request: &'a dyn Request,
        response: &'a mut dyn Response,
    ) -> Self {
        Self {
            session,
            request,
            response,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Whether there are unsaved changes.
    pub fn written(&self) -> bool {
        self.session.state() == SessionState::Dirty
    }

    /// Whether the loaded session has never been persisted. `false` while unloaded.
    pub fn is_new(&self) -> bool {
        self.session.record.as_ref().is_some_and(|r| r.is_new)
    }

    /// Loads the session from the store if that has not happened yet.
    pub async fn load(&mut self) {
        self.session.record(self.request).await;
    }

    pub async fn get(&mut self, key: &str) -> Option<Value> {
        self.session.record(self.request).await.values.get(key).cloned()
    }

    pub async fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.session
            .record_mut(self.request)
            .await
            .values
            .insert(key.into(), value.into());
    }

    pub async fn delete(&mut self, key: &str) {
        self.session.record_mut(self.request).await.values.remove(key);
    }

    /// Removes every value.
    pub async fn clear(&mut self) {
        self.session.record_mut(self.request).await.values.clear();
    }

    pub async fn add_flash(&mut self, value: impl Into<Value>) {
        self.add_flash_to(FLASH_KEY, value).await;
    }

    pub async fn add_flash_to(&mut self, key: &str, value: impl Into<Value>) {
        let record = self.session.record_mut(self.request).await;
        let slot = record
            .values
            .entry(key.to_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => items.push(value.into()),
            other => *other = Value::Array(vec![value.into()]),
        }
    }

    /// Returns and removes pending flash messages.
    pub async fn flashes(&mut self) -> Vec<Value> {
        self.flashes_from(FLASH_KEY).await
    }

    pub async fn flashes_from(&mut self, key: &str) -> Vec<Value> {
        if !self.session.record(self.request).await.values.contains_key(key) {
            return Vec::new();
        }
        match self.session.record_mut(self.request).await.values.remove(key) {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        }
    }

    pub async fn id(&mut self) -> String {
        self.session.record(self.request).await.id.clone()
    }

    pub async fn set_id(&mut self, id: impl Into<String>) {
        self.session.record_mut(self.request).await.id = id.into();
    }

    /// Replaces this session's options; saving with a negative `max_age`
    /// deletes it.
    pub async fn options(&mut self, options: SessionOptions) {
        self.session.options = options.clone();
        self.session.record_mut(self.request).await.options = options;
    }

    /// Persists pending changes. Does nothing unless the session is dirty.
    ///
    /// On failure the error is logged and the session stays dirty, so a later
    /// save in the same request can retry.
    pub async fn save(&mut self) -> Result<(), SessionError> {
        let Session {
            name,
            store,
            record,
            dirty,
            ..
        } = &mut *self.session;
        let (true, Some(record)) = (*dirty, record.as_mut()) else {
            return Ok(());
        };

        match store.save(self.request, &mut *self.response, record).await {
            Ok(()) => {
                *dirty = false;
                Ok(())
            }
            Err(err) => {
                error!(session = %name, error = %err, "session save failed");
                Err(err)
            }
        }
    }
}

/// Installs a [`Session`] on every request and saves it.
pub struct Sessions {
    options: SessionOptions,
    store: Arc<dyn Store>,
}

impl Sessions {
    pub fn new(options: SessionOptions, store: Arc<dyn Store>) -> Self {
        store.configure(&options);
        Self { options, store }
    }
}

#[async_trait]
impl Middleware for Sessions {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        ctx.set_session(Session::new(Arc::clone(&self.store), self.options.clone()));

        let client_side = self.store.client_side();
        ctx.add_pre_response_hook(move |ctx| {
            Box::pin(async move {
                let mut session = ctx.session()?;
                if session.written() && (client_side || session.is_new()) {
                    // failures are logged by save and retried after the handler
                    let _ = session.save().await;
                }
                Ok(())
            })
        });

        let result = next.run(ctx).await;

        if let Ok(mut session) = ctx.session() {
            let _ = session.save().await;
        }
        result
    }
}

/// Builds the session middleware for `options.engine`.
///
/// `cookie` uses a [`CookieStore`], `memory` a [`MemoryStore`] and `file` a
/// [`FileStore`] under `options.dir` (or the system temp directory). All of
/// them get random keys, so sessions do not survive a restart; use
/// [`Sessions::new`] with explicit keys for that.
///
/// # Errors
///
/// [`SessionError::UnknownEngine`] for any other engine name.
pub fn middleware(options: SessionOptions) -> Result<Sessions, SessionError> {
    let keys = vec![KeyPair::random()];
    let store: Arc<dyn Store> = match options.engine.as_str() {
        "" | "cookie" => Arc::new(CookieStore::new(keys)),
        "memory" => Arc::new(MemoryStore::new(keys)),
        "file" => {
            let dir = options
                .dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("webx-sessions"));
            Arc::new(FileStore::new(dir, keys))
        }
        other => return Err(SessionError::UnknownEngine(other.to_owned())),
    };
    Ok(Sessions::new(options, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use crate::middleware::tests::{body_of, context};
    use crate::middleware::{chain, from_middleware, handler_fn};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        gets: AtomicUsize,
        saves: AtomicUsize,
        fail_get: bool,
        fail_save: bool,
    }

    #[async_trait]
    impl Store for CountingStore {
        async fn get(&self, _req: &dyn Request, name: &str) -> Result<SessionRecord, SessionError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.fail_get {
                return Err(SessionError::InvalidSignature);
            }
            let mut record = SessionRecord::new(name, SessionOptions::default());
            record.values.insert("seen".into(), json!(true));
            record.is_new = false;
            Ok(record)
        }

        async fn save(
            &self,
            _req: &dyn Request,
            _res: &mut dyn Response,
            _record: &mut SessionRecord,
        ) -> Result<(), SessionError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_save {
                return Err(SessionError::Codec("disk full"));
            }
            Ok(())
        }

        fn configure(&self, _options: &SessionOptions) {}
    }

    fn session_ctx(store: &Arc<CountingStore>) -> Context {
        let mut ctx = context("GET", "/");
        let store: Arc<dyn Store> = Arc::clone(store) as Arc<dyn Store>;
        ctx.set_session(Session::new(store, SessionOptions::default()));
        ctx
    }

    #[tokio::test]
    async fn untouched_session_never_hits_the_store() {
        let store = Arc::new(CountingStore::default());
        let mut ctx = session_ctx(&store);
        let mut session = ctx.session().unwrap();
        assert_eq!(session.state(), SessionState::Unloaded);
        session.save().await.unwrap();
        assert_eq!(store.gets.load(Ordering::SeqCst), 0);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reads_load_once_and_never_save() {
        let store = Arc::new(CountingStore::default());
        let mut ctx = session_ctx(&store);
        let mut session = ctx.session().unwrap();
        assert_eq!(session.get("seen").await, Some(json!(true)));
        assert_eq!(session.get("other").await, None);
        assert!(!session.written());
        session.save().await.unwrap();
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_set_saves_exactly_once() {
        let store = Arc::new(CountingStore::default());
        let mut ctx = session_ctx(&store);
        let mut session = ctx.session().unwrap();
        session.set("user", "ann").await;
        assert!(session.written());

        session.save().await.unwrap();
        assert!(!session.written());
        session.save().await.unwrap();
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_save_stays_dirty() {
        let store = Arc::new(CountingStore {
            fail_save: true,
            ..Default::default()
        });
        let mut ctx = session_ctx(&store);
        let mut session = ctx.session().unwrap();
        session.set("k", 1).await;
        assert!(session.save().await.is_err());
        assert_eq!(session.state(), SessionState::Dirty);
        assert!(session.save().await.is_err());
        assert_eq!(store.saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn load_failure_gives_a_fresh_session() {
        let store = Arc::new(CountingStore {
            fail_get: true,
            ..Default::default()
        });
        let mut ctx = session_ctx(&store);
        let mut session = ctx.session().unwrap();
        assert_eq!(session.get("seen").await, None);
        assert!(session.is_new());
        assert_eq!(session.state(), SessionState::Loaded);
    }

    #[tokio::test]
    async fn flashes_are_consumed_and_mark_the_session_written() {
        let store = Arc::new(CountingStore::default());
        let mut ctx = session_ctx(&store);
        let mut session = ctx.session().unwrap();
        session.add_flash("saved").await;
        session.add_flash("again").await;
        session.save().await.unwrap();

        assert_eq!(session.flashes().await, vec![json!("saved"), json!("again")]);
        assert!(session.written());
        assert!(session.flashes().await.is_empty());
    }

    #[tokio::test]
    async fn middleware_saves_after_handler_error() {
        let store = Arc::new(CountingStore::default());
        let sessions = Sessions::new(SessionOptions::default(), Arc::clone(&store) as Arc<dyn Store>);
        let handler = handler_fn(|ctx| {
            Box::pin(async move {
                ctx.session()?.set("attempt", 1).await;
                Err(StatusCode::Conflict.into())
            })
        });

        let mut ctx = context("POST", "/");
        let result = chain(&[from_middleware(sessions)], handler).call(&mut ctx).await;
        assert!(result.is_err());
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn middleware_saves_after_cancellation() {
        let store = Arc::new(CountingStore::default());
        let sessions = Sessions::new(SessionOptions::default(), Arc::clone(&store) as Arc<dyn Store>);
        let handler = handler_fn(|ctx| {
            Box::pin(async move {
                ctx.session()?.set("cart", 3).await;
                ctx.cancellation_token().cancel();
                ctx.string(StatusCode::Ok, "too late").await
            })
        });

        let mut ctx = context("POST", "/");
        chain(&[from_middleware(sessions)], handler).call(&mut ctx).await.unwrap();
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert!(!ctx.response().committed());
        assert_eq!(ctx.session().unwrap().state(), SessionState::Loaded);
    }

    #[tokio::test]
    async fn middleware_without_session_use_touches_nothing() {
        let store = Arc::new(CountingStore::default());
        let sessions = Sessions::new(SessionOptions::default(), Arc::clone(&store) as Arc<dyn Store>);
        let handler = handler_fn(|ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "hi").await }));

        let mut ctx = context("GET", "/");
        chain(&[from_middleware(sessions)], handler).call(&mut ctx).await.unwrap();
        assert_eq!(store.gets.load(Ordering::SeqCst), 0);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cookie_session_is_written_before_the_body() {
        let sessions = middleware(SessionOptions::default()).unwrap();
        let handler = handler_fn(|ctx| {
            Box::pin(async move {
                ctx.session()?.set("user", "ann").await;
                ctx.string(StatusCode::Ok, "welcome").await
            })
        });

        let mut ctx = context("GET", "/");
        chain(&[from_middleware(sessions)], handler).call(&mut ctx).await.unwrap();
        let set_cookie = ctx.response().headers().get("set-cookie").map(str::to_owned);
        assert!(set_cookie.unwrap().starts_with("SID="));
        assert_eq!(body_of(ctx).1, "welcome");
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let options = SessionOptions {
            engine: "redis".into(),
            ..Default::default()
        };
        assert!(matches!(
            middleware(options),
            Err(SessionError::UnknownEngine(_))
        ));
    }
}
