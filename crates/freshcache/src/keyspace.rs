//! Mapping from caller keys to namespaced, fixed-length physical keys

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length in characters of every [`PhysicalKey`]
pub const PHYSICAL_KEY_LEN: usize = 64;

const FALLBACK_PREFIX: &str = "freshcache";

/// Backend-facing identifier: lowercase hex SHA-256 of namespace and key.
///
/// Always [`PHYSICAL_KEY_LEN`] characters from `[0-9a-f]`, so it is safe as
/// a file name, a primary key and a networked-store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhysicalKey(String);

impl PhysicalKey {
    /// Wrap an already hashed key, rejecting anything that is not 64 hex chars
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == PHYSICAL_KEY_LEN
            && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The leading `levels` two-character hex pairs, used for directory sharding
    pub fn shards(&self, levels: usize) -> impl Iterator<Item = &str> {
        let levels = levels.min(PHYSICAL_KEY_LEN / 2);
        (0..levels).map(move |i| &self.0[i * 2..i * 2 + 2])
    }
}

impl fmt::Display for PhysicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PhysicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deterministic, namespaced key hashing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space with an explicit namespace prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Create a key space namespaced by the application instance id
    pub fn for_instance() -> Self {
        Self::new(instance_id())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn physical_key(&self, key: &str) -> PhysicalKey {
        let mut hasher = Sha256::new();
        hasher.update(self.prefix.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.as_bytes());
        PhysicalKey(hex::encode(hasher.finalize()))
    }

    pub fn physical_keys<'a, I>(&self, keys: I) -> Vec<PhysicalKey>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter().map(|k| self.physical_key(k)).collect()
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::for_instance()
    }
}

/// Stable id for the running application, derived from its executable path
pub fn instance_id() -> String {
    match std::env::current_exe() {
        Ok(path) => {
            let digest = Sha256::digest(path.to_string_lossy().as_bytes());
            hex::encode(&digest[..4])
        }
        Err(_) => FALLBACK_PREFIX.to_string(),
    }
}
