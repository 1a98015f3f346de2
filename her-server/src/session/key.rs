//! Session key derivation.
//!
//! Every component scopes transcripts by the same key: a 128-bit digest of
//! the client identifier and the session identifier.

use sha2::{Digest, Sha256};
use std::fmt;

/// Separator placed between the client host and the session id.
const SEPARATOR: char = '_';

/// Digest length kept, in bytes (128 bits).
const KEY_BYTES: usize = 16;

/// Opaque transcript key derived from `(client_host, session_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derive the key for a client/session pair.
    ///
    /// The client host is length-prefixed so that a separator inside either
    /// input cannot make two different pairs hash the same preimage.
    pub fn derive(client_host: &str, session_id: &str) -> Self {
        let preimage = format!(
            "{}:{}{}{}",
            client_host.len(),
            client_host,
            SEPARATOR,
            session_id
        );
        let digest = Sha256::digest(preimage.as_bytes());
        Self(hex::encode(&digest[..KEY_BYTES]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which a shared store keeps this transcript.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
