//! API key generation and hashing.

use rand::RngCore;
use sha2::{Digest, Sha256};

pub const KEY_PREFIX_MARKER: &str = "pk_";

/// Characters of the secret repeated in the public prefix.
pub const KEY_PREFIX_LENGTH: usize = 8;

const SECRET_BYTES: usize = 32;

/// A freshly minted key. `plaintext` is handed to the caller once and never stored.
pub struct GeneratedApiKey {
    pub plaintext: String,
    pub prefix: String,
    pub hash: String,
}

impl std::fmt::Debug for GeneratedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedApiKey")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

pub fn generate_api_key() -> GeneratedApiKey {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let secret = hex::encode(bytes);

    let prefix = format!("{}{}", KEY_PREFIX_MARKER, &secret[..KEY_PREFIX_LENGTH]);
    let plaintext = format!("{}_{}", prefix, secret);
    let hash = hash_api_key(&plaintext);

    GeneratedApiKey {
        plaintext,
        prefix,
        hash,
    }
}

/// SHA-256 hex digest of the full plaintext key.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Cheap shape check before touching the store.
pub fn looks_like_api_key(key: &str) -> bool {
    key.starts_with(KEY_PREFIX_MARKER)
        && key.len() == KEY_PREFIX_MARKER.len() + KEY_PREFIX_LENGTH + 1 + SECRET_BYTES * 2
}
