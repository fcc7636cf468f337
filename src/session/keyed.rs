//! Server-side stores: the cookie carries only a signed session id, the
//! values live in a [`Backend`] keyed by that id.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::codec::{KeyPair, SecureCodec};
use super::cookie::{self, Cookie, expires_at, unix_now};
use super::{SessionError, SessionOptions, SessionRecord, Store};
use crate::engine::{Request, Response};

/// Where a keyed store keeps session values.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Values for `id`, or `None` when unknown or expired.
    async fn load(&self, id: &str) -> Result<Option<Map<String, Value>>, SessionError>;

    /// Writes values for `id`; `max_age` seconds, `0` for no expiry.
    async fn store(&self, id: &str, values: &Map<String, Value>, max_age: i64) -> Result<(), SessionError>;

    async fn remove(&self, id: &str) -> Result<(), SessionError>;
}

/// A [`Store`] over any [`Backend`].
pub struct KeyedStore<B> {
    backend: B,
    codec: SecureCodec,
    options: ArcSwap<SessionOptions>,
}

/// Sessions in process memory.
pub type MemoryStore = KeyedStore<MemoryBackend>;

/// Sessions as JSON files, one per id.
pub type FileStore = KeyedStore<FileBackend>;

impl<B: Backend> KeyedStore<B> {
    pub fn with_backend(backend: B, keys: Vec<KeyPair>) -> Self {
        Self {
            backend,
            codec: SecureCodec::new(keys),
            options: ArcSwap::from_pointee(SessionOptions::default()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl KeyedStore<MemoryBackend> {
    pub fn new(keys: Vec<KeyPair>) -> Self {
        Self::with_backend(MemoryBackend::default(), keys)
    }
}

impl KeyedStore<FileBackend> {
    pub fn new(dir: impl Into<PathBuf>, keys: Vec<KeyPair>) -> Self {
        Self::with_backend(FileBackend::new(dir), keys)
    }
}

#[async_trait]
impl<B: Backend> Store for KeyedStore<B> {
    async fn get(&self, request: &dyn Request, name: &str) -> Result<SessionRecord, SessionError> {
        let mut record = SessionRecord::new(name, (**self.options.load()).clone());
        let Some(raw) = cookie::find(request.headers(), name) else {
            return Ok(record);
        };

        let id = String::from_utf8(self.codec.decode(name, raw)?)
            .map_err(|e| SessionError::Malformed(e.to_string()))?;
        if let Some(values) = self.backend.load(&id).await? {
            record.values = values;
            record.is_new = false;
        }
        record.id = id;
        Ok(record)
    }

    async fn save(
        &self,
        _request: &dyn Request,
        response: &mut dyn Response,
        record: &mut SessionRecord,
    ) -> Result<(), SessionError> {
        if record.options.max_age < 0 {
            if !record.id.is_empty() {
                self.backend.remove(&record.id).await?;
            }
            let cookie = Cookie {
                name: &record.name,
                value: "",
                options: &record.options,
            };
            return cookie::set(response, &cookie);
        }

        if record.id.is_empty() {
            record.id = Uuid::new_v4().simple().to_string();
        }
        self.backend
            .store(&record.id, &record.values, record.options.max_age)
            .await?;

        let encoded = self.codec.encode(&record.name, record.id.as_bytes())?;
        let cookie = Cookie {
            name: &record.name,
            value: &encoded,
            options: &record.options,
        };
        match cookie::set(response, &cookie) {
            // The client already holds this id; only the expiry refresh is lost.
            Err(SessionError::HeadersCommitted) if !record.is_new => {
                debug!(session = %record.name, "cookie refresh skipped, response committed");
            }
            other => other?,
        }
        record.is_new = false;
        Ok(())
    }

    fn configure(&self, options: &SessionOptions) {
        self.options.store(options.clone().into());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    values: Map<String, Value>,
    #[serde(default)]
    expires: i64,
}

impl Entry {
    fn new(values: &Map<String, Value>, max_age: i64) -> Self {
        Self {
            values: values.clone(),
            expires: expires_at(max_age),
        }
    }

    fn expired(&self) -> bool {
        self.expires != 0 && self.expires < unix_now()
    }
}

/// Process-local map of sessions.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn load(&self, id: &str) -> Result<Option<Map<String, Value>>, SessionError> {
        {
            let entries = self.entries.read().await;
            match entries.get(id) {
                None => return Ok(None),
                Some(entry) if !entry.expired() => return Ok(Some(entry.values.clone())),
                Some(_) => {}
            }
        }
        self.entries.write().await.remove(id);
        Ok(None)
    }

    async fn store(&self, id: &str, values: &Map<String, Value>, max_age: i64) -> Result<(), SessionError> {
        self.entries
            .write()
            .await
            .insert(id.to_owned(), Entry::new(values, max_age));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SessionError> {
        self.entries.write().await.remove(id);
        Ok(())
    }
}

/// One JSON file per session under a directory.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &str) -> Result<PathBuf, SessionError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SessionError::Malformed(format!("invalid session id {id:?}")));
        }
        Ok(self.dir.join(format!("session_{id}")))
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn load(&self, id: &str) -> Result<Option<Map<String, Value>>, SessionError> {
        let path = self.path(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: Entry = serde_json::from_slice(&bytes)?;
        if entry.expired() {
            self.remove(id).await?;
            return Ok(None);
        }
        Ok(Some(entry.values))
    }

    async fn store(&self, id: &str, values: &Map<String, Value>, max_age: i64) -> Result<(), SessionError> {
        let path = self.path(id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec(&Entry::new(values, max_age))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SessionError> {
        match tokio::fs::remove_file(self.path(id)?).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
