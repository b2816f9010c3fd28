//! Opaque callback paths and verification tokens.
//!
//! The hub only ever sees two opaque strings minted by the subscriber: the
//! callback path (which must decode back to the subscription memo on every
//! inbound request) and the verification token (which must prove the
//! subscribe/unsubscribe handshake originated here). Both are pluggable so a
//! load-balanced deployment can back them with shared storage instead of
//! crypto; the defaults encrypt the values with a shared secret, so any
//! process holding the secret can decode paths and tokens minted by another.
//!
//! The default scheme is AES-256-GCM keyed by the SHA-256 of the secret. The
//! ciphertext is authenticated, so a forged or corrupted path/token fails
//! decryption and degrades to "not found" — decode failures are never errors.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// AES-GCM nonce length in bytes, prepended to every ciphertext.
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The memo or token payload could not be serialized.
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Symmetric encryption failed.
    #[error("Encryption failed")]
    Encrypt,
}

/// The two handshake actions a verification token can vouch for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Subscribe => "subscribe",
            Action::Unsubscribe => "unsubscribe",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subscriber's private record for one subscription, recoverable from
/// its encoded callback path.
///
/// `expiry` is a *verification* deadline (epoch milliseconds): it is set only
/// when the caller requested a lease and opted out of auto-renewal, and is
/// checked on inbound subscribe verification. Once verified, no further
/// expiry check occurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memo {
    pub user_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
}

/// Turns subscription memos into opaque callback paths and back.
pub trait PathCodec: Send + Sync {
    /// Encode a memo into a callback path (starting with `/`).
    fn create(&self, memo: &Memo) -> Result<String, CodecError>;
    /// Recover the memo from a path. Any decode failure is `None`.
    fn lookup(&self, path: &str) -> Option<Memo>;
}

/// Mints and checks verification tokens for subscribe/unsubscribe handshakes.
///
/// A token is valid for lookup under one (action, topic) pair. The embedded
/// nonce is never checked: possession of a token that decodes at all proves
/// possession of the shared secret, not freshness or single use.
pub trait TokenCodec: Send + Sync {
    fn create(&self, action: Action, topic: &str) -> Result<String, CodecError>;
    fn lookup(&self, token: &str, action: Action, topic: &str) -> bool;
}

/// Shared AEAD wrapper for the default codecs.
#[derive(Clone)]
struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        SecretBox {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<String, CodecError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CodecError::Encrypt)?;
        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn open(&self, encoded: &str) -> Option<Vec<u8>> {
        let raw = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        if raw.len() < NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
    }
}

/// Default path codec: the memo itself, encrypted.
///
/// No subscription table is kept anywhere — the path *is* the record.
#[derive(Clone)]
pub struct CryptoPathCodec {
    secret: SecretBox,
}

impl CryptoPathCodec {
    pub fn new(secret: &str) -> Self {
        CryptoPathCodec {
            secret: SecretBox::new(secret),
        }
    }
}

impl PathCodec for CryptoPathCodec {
    fn create(&self, memo: &Memo) -> Result<String, CodecError> {
        let plaintext = serde_json::to_vec(memo)?;
        Ok(format!("/{}", self.secret.seal(&plaintext)?))
    }

    fn lookup(&self, path: &str) -> Option<Memo> {
        let encoded = path.strip_prefix('/')?;
        let plaintext = self.secret.open(encoded)?;
        serde_json::from_slice(&plaintext).ok()
    }
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    action: Action,
    topic: String,
    /// Random filler so identical (action, topic) pairs still yield distinct
    /// tokens. Deliberately not checked on lookup.
    nonce: String,
}

/// Default token codec: `{action, topic, nonce}`, encrypted.
#[derive(Clone)]
pub struct CryptoTokenCodec {
    secret: SecretBox,
}

impl CryptoTokenCodec {
    pub fn new(secret: &str) -> Self {
        CryptoTokenCodec {
            secret: SecretBox::new(secret),
        }
    }
}

impl TokenCodec for CryptoTokenCodec {
    fn create(&self, action: Action, topic: &str) -> Result<String, CodecError> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let payload = TokenPayload {
            action,
            topic: topic.to_owned(),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
        };
        self.secret.seal(&serde_json::to_vec(&payload)?)
    }

    fn lookup(&self, token: &str, action: Action, topic: &str) -> bool {
        let Some(plaintext) = self.secret.open(token) else {
            return false;
        };
        match serde_json::from_slice::<TokenPayload>(&plaintext) {
            Ok(payload) => payload.action == action && payload.topic == topic,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memo(data: &str) -> Memo {
        Memo {
            user_data: json!(data),
            expiry: None,
        }
    }

    #[test]
    fn path_round_trip() {
        let codec = CryptoPathCodec::new("s3cret");
        let m = Memo {
            user_data: json!({"feed": "http://example.com/a"}),
            expiry: Some(1_700_000_000_000),
        };
        let path = codec.create(&m).unwrap();
        assert!(path.starts_with('/'));
        assert_eq!(Some(m), codec.lookup(&path));
    }

    #[test]
    fn path_rejects_wrong_key() {
        let codec = CryptoPathCodec::new("s3cret");
        let other = CryptoPathCodec::new("different");
        let path = codec.create(&memo("x")).unwrap();
        assert_eq!(None, other.lookup(&path));
    }

    #[test]
    fn path_rejects_tampering() {
        let codec = CryptoPathCodec::new("s3cret");
        let path = codec.create(&memo("x")).unwrap();
        let mut tampered: Vec<char> = path.chars().collect();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == 'A' { 'B' } else { 'A' };
        let tampered: String = tampered.into_iter().collect();
        assert_eq!(None, codec.lookup(&tampered));
    }

    #[test]
    fn path_rejects_garbage() {
        let codec = CryptoPathCodec::new("s3cret");
        assert_eq!(None, codec.lookup("/not base64 at all!"));
        assert_eq!(None, codec.lookup("missing-leading-slash"));
        assert_eq!(None, codec.lookup("/"));
    }

    #[test]
    fn token_checks_action_and_topic() {
        let codec = CryptoTokenCodec::new("s3cret");
        let token = codec
            .create(Action::Subscribe, "http://example.com/t")
            .unwrap();
        assert!(codec.lookup(&token, Action::Subscribe, "http://example.com/t"));
        assert!(!codec.lookup(&token, Action::Unsubscribe, "http://example.com/t"));
        assert!(!codec.lookup(&token, Action::Subscribe, "http://example.com/other"));
    }

    #[test]
    fn token_rejects_garbage_and_wrong_key() {
        let codec = CryptoTokenCodec::new("s3cret");
        assert!(!codec.lookup("", Action::Subscribe, "t"));
        assert!(!codec.lookup("zzzz", Action::Subscribe, "t"));

        let other = CryptoTokenCodec::new("different");
        let token = codec.create(Action::Subscribe, "t").unwrap();
        assert!(!other.lookup(&token, Action::Subscribe, "t"));
    }

    #[test]
    fn tokens_for_same_pair_are_distinct() {
        let codec = CryptoTokenCodec::new("s3cret");
        let a = codec.create(Action::Subscribe, "t").unwrap();
        let b = codec.create(Action::Subscribe, "t").unwrap();
        assert_ne!(a, b);
        assert!(codec.lookup(&a, Action::Subscribe, "t"));
        assert!(codec.lookup(&b, Action::Subscribe, "t"));
    }
}
