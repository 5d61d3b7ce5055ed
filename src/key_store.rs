//! Access key records and their persistence boundary.
//!
//! [`KeyStore`] is the seam between the [`KeyLedger`](crate::KeyLedger) and
//! wherever keys live. [`HashmapKeyStore`] keeps them in memory.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Number of digits in a generated key identifier.
pub const KEY_ID_LEN: usize = 12;

const KEY_ID_SPACE: u64 = 1_000_000_000_000;

/// Identifier presented by callers to unlock a retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Wraps a presented identifier as-is.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random 12-digit identifier, zero-padded.
    #[must_use]
    pub fn generate() -> Self {
        let value = rand::rng().random_range(0..KEY_ID_SPACE);
        Self(format!("{value:0width$}", width = KEY_ID_LEN))
    }

    /// Returns the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier with all but the last four characters hidden, for logs.
    #[must_use]
    pub fn masked(&self) -> String {
        let visible = self.0.chars().rev().take(4).collect::<Vec<_>>();
        let hidden = self.0.chars().count() - visible.len();
        "*".repeat(hidden) + &visible.into_iter().rev().collect::<String>()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A time- and use-limited access key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKey {
    /// The identifier callers present.
    #[serde(rename = "key")]
    pub id: KeyId,
    /// Retrievals still allowed.
    pub uses_left: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Lifetime in seconds.
    pub duration_secs: i64,
    /// `created_at + duration_secs`.
    pub expires_at: DateTime<Utc>,
}

impl AccessKey {
    /// Creates a key valid for `duration_secs` from `created_at`.
    ///
    /// Returns `None` when the expiry cannot be represented.
    #[must_use]
    pub fn new(
        id: KeyId,
        uses_left: u32,
        created_at: DateTime<Utc>,
        duration_secs: i64,
    ) -> Option<Self> {
        let lifetime = chrono::Duration::try_seconds(duration_secs)?;
        Some(Self {
            id,
            uses_left,
            created_at,
            duration_secs,
            expires_at: created_at.checked_add_signed(lifetime)?,
        })
    }

    /// Returns `true` once `now` has reached the expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Errors reported by a [`KeyStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyStoreError {
    /// No key with this identifier.
    #[error("key not found")]
    NotFound,
    /// A key with this identifier already exists.
    #[error("key already exists")]
    AlreadyExists,
    /// Backend failure.
    #[error("unexpected key store error: {0}")]
    Unexpected(String),
}

/// Persistence for access keys.
///
/// Implementations must enforce identifier uniqueness in [`create`](Self::create).
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync {
    /// Looks up a key.
    async fn find(&self, id: &KeyId) -> Result<AccessKey, KeyStoreError>;

    /// Inserts a new key, failing with [`KeyStoreError::AlreadyExists`] on a duplicate id.
    async fn create(&mut self, key: AccessKey) -> Result<(), KeyStoreError>;

    /// Overwrites an existing key.
    async fn save(&mut self, key: AccessKey) -> Result<(), KeyStoreError>;

    /// Removes a key.
    async fn delete(&mut self, id: &KeyId) -> Result<(), KeyStoreError>;

    /// All keys, newest `created_at` first.
    async fn list_sorted(&self) -> Result<Vec<AccessKey>, KeyStoreError>;
}

/// In-memory [`KeyStore`].
#[derive(Debug, Default)]
pub struct HashmapKeyStore {
    keys: HashMap<KeyId, AccessKey>,
}

#[async_trait::async_trait]
impl KeyStore for HashmapKeyStore {
    async fn find(&self, id: &KeyId) -> Result<AccessKey, KeyStoreError> {
        self.keys.get(id).cloned().ok_or(KeyStoreError::NotFound)
    }

    async fn create(&mut self, key: AccessKey) -> Result<(), KeyStoreError> {
        if self.keys.contains_key(&key.id) {
            return Err(KeyStoreError::AlreadyExists);
        }
        self.keys.insert(key.id.clone(), key);
        Ok(())
    }

    async fn save(&mut self, key: AccessKey) -> Result<(), KeyStoreError> {
        match self.keys.get_mut(&key.id) {
            Some(existing) => {
                *existing = key;
                Ok(())
            }
            None => Err(KeyStoreError::NotFound),
        }
    }

    async fn delete(&mut self, id: &KeyId) -> Result<(), KeyStoreError> {
        self.keys
            .remove(id)
            .map(|_| ())
            .ok_or(KeyStoreError::NotFound)
    }

    async fn list_sorted(&self) -> Result<Vec<AccessKey>, KeyStoreError> {
        let mut keys: Vec<AccessKey> = self.keys.values().cloned().collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }
}
