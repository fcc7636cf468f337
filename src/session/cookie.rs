//! Cookie header helpers and the client-side [`CookieStore`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::codec::{KeyPair, SecureCodec};
use super::{SessionError, SessionOptions, SessionRecord, Store};
use crate::engine::{Request, Response};
use crate::http::Headers;

/// A `Set-Cookie` line built from session options.
pub struct Cookie<'a> {
    pub name: &'a str,
    pub value: &'a str,
    pub options: &'a SessionOptions,
}

impl fmt::Display for Cookie<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expired = self.options.max_age < 0;
        let value = if expired { "" } else { self.value };
        write!(f, "{}={}", self.name, value)?;
        if !self.options.path.is_empty() {
            write!(f, "; Path={}", self.options.path)?;
        }
        if !self.options.domain.is_empty() {
            write!(f, "; Domain={}", self.options.domain)?;
        }
        if expired {
            f.write_str("; Max-Age=0")?;
        } else if self.options.max_age > 0 {
            write!(f, "; Max-Age={}", self.options.max_age)?;
        }
        if self.options.secure {
            f.write_str("; Secure")?;
        }
        if self.options.http_only {
            f.write_str("; HttpOnly")?;
        }
        Ok(())
    }
}

/// Value of the request cookie `name`, from any `Cookie` header.
pub fn find<'h>(headers: &'h Headers, name: &str) -> Option<&'h str> {
    headers
        .get_all("cookie")
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
}

/// Sets `cookie` on the response, dropping an earlier `Set-Cookie` for the same name.
pub(crate) fn set(response: &mut dyn Response, cookie: &Cookie<'_>) -> Result<(), SessionError> {
    if response.committed() {
        return Err(SessionError::HeadersCommitted);
    }
    let prefix = format!("{}=", cookie.name);
    let headers = response.headers_mut();
    let kept: Vec<String> = headers
        .get_all("set-cookie")
        .filter(|line| !line.starts_with(&prefix))
        .map(str::to_owned)
        .collect();
    headers.remove("set-cookie");
    for line in kept {
        headers.insert("Set-Cookie", line);
    }
    headers.insert("Set-Cookie", cookie.to_string());
    Ok(())
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Expiry as a unix timestamp; `0` means no expiry.
pub(crate) fn expires_at(max_age: i64) -> i64 {
    if max_age > 0 { unix_now() + max_age } else { 0 }
}

#[derive(Serialize, Deserialize)]
struct Payload {
    #[serde(rename = "v")]
    values: Map<String, Value>,
    #[serde(rename = "e", default)]
    expires: i64,
}

/// Keeps the whole session in a signed, optionally encrypted cookie.
///
/// The encoded cookie is capped at 4096 bytes; saving a larger session fails
/// with [`SessionError::TooLarge`].
pub struct CookieStore {
    codec: SecureCodec,
    options: ArcSwap<SessionOptions>,
}

impl CookieStore {
    pub fn new(keys: Vec<KeyPair>) -> Self {
        Self {
            codec: SecureCodec::new(keys),
            options: ArcSwap::from_pointee(SessionOptions::default()),
        }
    }

    /// A store with random keys; sessions end with the process.
    pub fn random() -> Self {
        Self::new(vec![KeyPair::random()])
    }
}

#[async_trait]
impl Store for CookieStore {
    async fn get(&self, request: &dyn Request, name: &str) -> Result<SessionRecord, SessionError> {
        let mut record = SessionRecord::new(name, (**self.options.load()).clone());
        let Some(raw) = find(request.headers(), name) else {
            return Ok(record);
        };

        let payload: Payload = serde_json::from_slice(&self.codec.decode(name, raw)?)?;
        if payload.expires != 0 && payload.expires < unix_now() {
            return Err(SessionError::Expired);
        }
        record.values = payload.values;
        record.is_new = false;
        Ok(record)
    }

    async fn save(
        &self,
        _request: &dyn Request,
        response: &mut dyn Response,
        record: &mut SessionRecord,
    ) -> Result<(), SessionError> {
        let encoded = if record.options.max_age < 0 {
            String::new()
        } else {
            let payload = Payload {
                values: record.values.clone(),
                expires: expires_at(record.options.max_age),
            };
            self.codec.encode(&record.name, &serde_json::to_vec(&payload)?)?
        };
        set(
            response,
            &Cookie {
                name: &record.name,
                value: &encoded,
                options: &record.options,
            },
        )?;
        record.is_new = false;
        Ok(())
    }

    fn configure(&self, options: &SessionOptions) {
        self.options.store(options.clone().into());
    }

    fn client_side(&self) -> bool {
        true
    }
}
