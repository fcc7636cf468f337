//! Authenticated, optionally encrypted encoding of cookie values.
//!
//! Layout: `base64url(body) "." base64url(hmac)`, where `body` is the payload
//! or `nonce || ciphertext` when a block key is configured, and the HMAC-SHA256
//! covers `name "|" base64url(body)` so a value cannot be replayed under
//! another cookie name.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::SessionError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// Largest cookie value browsers reliably keep.
pub const MAX_COOKIE_LEN: usize = 4096;

/// One signing key, plus an optional encryption key.
#[derive(Clone)]
pub struct KeyPair {
    hash_key: Vec<u8>,
    block_key: Option<[u8; 32]>,
}

impl KeyPair {
    pub fn new(hash_key: impl Into<Vec<u8>>) -> Self {
        Self {
            hash_key: hash_key.into(),
            block_key: None,
        }
    }

    /// Also encrypts values with ChaCha20-Poly1305 under `block_key`.
    #[must_use]
    pub fn with_encryption(mut self, block_key: [u8; 32]) -> Self {
        self.block_key = Some(block_key);
        self
    }

    /// Fresh random signing and encryption keys. Values encoded with them do
    /// not survive a process restart.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut hash_key = vec![0u8; 64];
        rng.fill_bytes(&mut hash_key);
        let mut block_key = [0u8; 32];
        rng.fill_bytes(&mut block_key);
        Self::new(hash_key).with_encryption(block_key)
    }

    fn mac(&self, name: &str, body: &str) -> Result<HmacSha256, SessionError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hash_key)
            .map_err(|_| SessionError::Codec("invalid hash key"))?;
        mac.update(name.as_bytes());
        mac.update(b"|");
        mac.update(body.as_bytes());
        Ok(mac)
    }
}

/// Encodes with the first key pair and decodes with any of them, so keys
/// can be rotated by prepending a new pair.
#[derive(Clone)]
pub struct SecureCodec {
    keys: Vec<KeyPair>,
    max_len: usize,
}

impl SecureCodec {
    pub fn new(keys: Vec<KeyPair>) -> Self {
        Self {
            keys,
            max_len: MAX_COOKIE_LEN,
        }
    }

    /// Overrides the encoded length ceiling; `0` disables the check.
    #[must_use]
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn encode(&self, name: &str, payload: &[u8]) -> Result<String, SessionError> {
        let key = self
            .keys
            .first()
            .ok_or(SessionError::Codec("no keys configured"))?;

        let body = match &key.block_key {
            Some(block_key) => {
                let cipher = ChaCha20Poly1305::new(block_key.into());
                let mut nonce = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce), payload)
                    .map_err(|_| SessionError::Codec("encryption failed"))?;
                [nonce.as_slice(), &ciphertext].concat()
            }
            None => payload.to_vec(),
        };

        let body = URL_SAFE_NO_PAD.encode(body);
        let tag = key.mac(name, &body)?.finalize().into_bytes();
        let encoded = format!("{body}.{}", URL_SAFE_NO_PAD.encode(tag));

        if self.max_len > 0 && encoded.len() > self.max_len {
            return Err(SessionError::TooLarge {
                size: encoded.len(),
                max: self.max_len,
            });
        }
        Ok(encoded)
    }

    pub fn decode(&self, name: &str, value: &str) -> Result<Vec<u8>, SessionError> {
        let (body, tag) = value
            .split_once('.')
            .ok_or_else(|| SessionError::Malformed("missing signature".to_owned()))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|e| SessionError::Malformed(e.to_string()))?;

        for key in &self.keys {
            if key.mac(name, body)?.verify_slice(&tag).is_err() {
                continue;
            }
            let raw = URL_SAFE_NO_PAD
                .decode(body)
                .map_err(|e| SessionError::Malformed(e.to_string()))?;
            return match &key.block_key {
                Some(block_key) => {
                    if raw.len() < NONCE_LEN {
                        return Err(SessionError::Malformed("ciphertext too short".to_owned()));
                    }
                    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
                    ChaCha20Poly1305::new(block_key.into())
                        .decrypt(Nonce::from_slice(nonce), ciphertext)
                        .map_err(|_| SessionError::Codec("decryption failed"))
                }
                None => Ok(raw),
            };
        }
        Err(SessionError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_value_decodes() {
        let codec = SecureCodec::new(vec![KeyPair::new(b"secret".to_vec())]);
        let encoded = codec.encode("SID", b"hello").unwrap();
        assert_eq!(codec.decode("SID", &encoded).unwrap(), b"hello");
    }

    #[test]
    fn encrypted_value_hides_payload() {
        let codec = SecureCodec::new(vec![KeyPair::random()]);
        let encoded = codec.encode("SID", b"top secret").unwrap();
        assert!(!encoded.contains(&URL_SAFE_NO_PAD.encode(b"top secret")));
        assert_eq!(codec.decode("SID", &encoded).unwrap(), b"top secret");
    }

    #[test]
    fn tampering_and_renaming_are_rejected() {
        let codec = SecureCodec::new(vec![KeyPair::new(b"k".to_vec())]);
        let encoded = codec.encode("SID", b"v").unwrap();

        let mut tampered = encoded.clone();
        tampered.insert(0, 'A');
        assert!(matches!(
            codec.decode("SID", &tampered),
            Err(SessionError::InvalidSignature)
        ));
        assert!(matches!(
            codec.decode("OTHER", &encoded),
            Err(SessionError::InvalidSignature)
        ));
    }

    #[test]
    fn rotated_keys_still_decode() {
        let old = KeyPair::new(b"old".to_vec());
        let encoded = SecureCodec::new(vec![old.clone()]).encode("SID", b"v").unwrap();
        let rotated = SecureCodec::new(vec![KeyPair::new(b"new".to_vec()), old]);
        assert_eq!(rotated.decode("SID", &encoded).unwrap(), b"v");
    }

    #[test]
    fn oversized_values_are_refused() {
        let codec = SecureCodec::new(vec![KeyPair::new(b"k".to_vec())]);
        let err = codec.encode("SID", &vec![b'x'; MAX_COOKIE_LEN]).unwrap_err();
        assert!(matches!(err, SessionError::TooLarge { max: MAX_COOKIE_LEN, .. }));
    }
}
