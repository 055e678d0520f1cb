use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SECRET_LEN: usize = 32;
const TAG_LEN: usize = 32;

/// Identity of one circuit.
///
/// The token is handed to the peer and is the only thing it can present to
/// reconnect. The key is a one-way digest of the token's secret and is what
/// the registry indexes on, so a key leaking into logs reveals nothing the
/// peer could replay.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CircuitId {
    token: String,
    key: String,
}

impl CircuitId {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Debug for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitId").field("key", &self.key).finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("circuit token is malformed")]
    Malformed,
    #[error("circuit token failed verification")]
    Tampered,
}

/// Mints and validates circuit tokens with a process-held HMAC key.
#[derive(Clone)]
pub struct CircuitIdFactory {
    mac_key: Arc<[u8]>,
}

impl CircuitIdFactory {
    pub fn new(mac_key: impl Into<Vec<u8>>) -> Self {
        Self {
            mac_key: Arc::from(mac_key.into()),
        }
    }

    pub fn random() -> Self {
        let mut key = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn create(&self) -> CircuitId {
        let mut secret = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        self.seal(&secret)
    }

    pub fn parse(&self, token: &str) -> Result<CircuitId, TokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| TokenError::Malformed)?;
        if raw.len() != SECRET_LEN + TAG_LEN {
            return Err(TokenError::Malformed);
        }
        let (secret, tag) = raw.split_at(SECRET_LEN);
        let mut mac = self.mac();
        mac.update(secret);
        mac.verify_slice(tag).map_err(|_| TokenError::Tampered)?;
        Ok(self.seal(secret))
    }

    fn seal(&self, secret: &[u8]) -> CircuitId {
        let mut mac = self.mac();
        mac.update(secret);
        let tag = mac.finalize().into_bytes();

        let mut sealed = Vec::with_capacity(SECRET_LEN + TAG_LEN);
        sealed.extend_from_slice(secret);
        sealed.extend_from_slice(&tag);

        CircuitId {
            token: URL_SAFE_NO_PAD.encode(sealed),
            key: URL_SAFE_NO_PAD.encode(Sha256::digest(secret)),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.mac_key).expect("hmac accepts keys of any length")
    }
}

impl fmt::Debug for CircuitIdFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitIdFactory").finish_non_exhaustive()
    }
}
