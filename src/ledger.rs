//! Validation and accounting of access keys.
//!
//! Every retrieval is gated by [`KeyLedger::validate`] and charged exactly once
//! with [`KeyLedger::charge`] afterwards, whether or not a code was found.
//! Expired and spent keys are deleted the moment they are observed.

use crate::config::KeyPolicy;
use crate::error::{Error, Result};
use crate::key_store::{AccessKey, KeyId, KeyStore, KeyStoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// How many identifiers are tried before giving up on key creation.
pub const MAX_ID_ATTEMPTS: usize = 5;

/// Shared handle to a key store.
pub type KeyStoreType = Arc<RwLock<dyn KeyStore>>;

/// Validates, charges and issues access keys.
#[derive(Clone)]
pub struct KeyLedger {
    store: KeyStoreType,
    policy: KeyPolicy,
}

impl KeyLedger {
    /// Creates a ledger over `store` issuing keys under `policy`.
    pub fn new(store: KeyStoreType, policy: KeyPolicy) -> Self {
        Self { store, policy }
    }

    /// The rules new keys are issued under.
    #[must_use]
    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Checks that `id` names a live key with uses left.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidKey`] if no such key exists
    /// - [`Error::KeyExpired`] if it is past its expiry (the key is deleted)
    /// - [`Error::KeyExhausted`] if it has no uses left (the key is deleted)
    pub async fn validate(&self, id: &KeyId) -> Result<AccessKey> {
        self.validate_at(id, Utc::now()).await
    }

    /// [`validate`](Self::validate) against an explicit clock reading.
    ///
    /// # Errors
    ///
    /// See [`validate`](Self::validate).
    #[instrument(name = "KeyLedger::validate", skip_all, fields(key_id = %id.masked()))]
    pub async fn validate_at(&self, id: &KeyId, now: DateTime<Utc>) -> Result<AccessKey> {
        let mut store = self.store.write().await;

        let key = match store.find(id).await {
            Ok(key) => key,
            Err(KeyStoreError::NotFound) => {
                debug!("Unknown key presented");
                return Err(Error::InvalidKey);
            }
            Err(source) => return Err(Error::KeyStore { source }),
        };

        let rejection = if key.is_expired_at(now) {
            Error::KeyExpired
        } else if key.uses_left == 0 {
            Error::KeyExhausted
        } else {
            return Ok(key);
        };

        info!(reason = %rejection, "Removing unusable key");
        match store.delete(id).await {
            Ok(()) | Err(KeyStoreError::NotFound) => Err(rejection),
            Err(source) => Err(Error::KeyStore { source }),
        }
    }

    /// Uses up one retrieval on `id`, deleting the key when none remain.
    ///
    /// Returns the uses left afterwards. A key that disappeared since it was
    /// validated counts as already spent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyStore`] if the store fails.
    #[instrument(name = "KeyLedger::charge", skip_all, fields(key_id = %id.masked()))]
    pub async fn charge(&self, id: &KeyId) -> Result<u32> {
        let mut store = self.store.write().await;

        let mut key = match store.find(id).await {
            Ok(key) => key,
            Err(KeyStoreError::NotFound) => {
                warn!("Key vanished before it could be charged");
                return Ok(0);
            }
            Err(source) => return Err(Error::KeyStore { source }),
        };

        key.uses_left = key.uses_left.saturating_sub(1);
        let uses_left = key.uses_left;

        let result = if uses_left == 0 {
            store.delete(id).await
        } else {
            store.save(key).await
        };
        match result {
            Ok(()) | Err(KeyStoreError::NotFound) => {
                debug!(uses_left, "Key charged");
                Ok(uses_left)
            }
            Err(source) => Err(Error::KeyStore { source }),
        }
    }

    /// Issues a new key valid for `duration_minutes`, or the policy default.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDuration`] if the duration is outside the policy bounds
    /// - [`Error::KeyIdCollision`] if every generated identifier was taken
    #[instrument(name = "KeyLedger::create", skip(self))]
    pub async fn create(&self, duration_minutes: Option<f64>) -> Result<AccessKey> {
        let minutes = duration_minutes.unwrap_or(self.policy.default_minutes);
        let duration_secs = self.duration_secs(minutes)?;
        let now = Utc::now();

        let mut store = self.store.write().await;
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let Some(key) =
                AccessKey::new(KeyId::generate(), self.policy.initial_uses, now, duration_secs)
            else {
                return Err(self.invalid_duration(minutes));
            };

            match store.create(key.clone()).await {
                Ok(()) => {
                    info!(
                        key_id = %key.id.masked(),
                        duration_secs,
                        expires_at = %key.expires_at,
                        "Key created"
                    );
                    return Ok(key);
                }
                Err(KeyStoreError::AlreadyExists) => {
                    debug!(attempt, "Generated key id already taken");
                }
                Err(source) => return Err(Error::KeyStore { source }),
            }
        }

        Err(Error::KeyIdCollision {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// All keys, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyStore`] if the store fails.
    pub async fn list(&self) -> Result<Vec<AccessKey>> {
        self.store
            .read()
            .await
            .list_sorted()
            .await
            .map_err(|source| Error::KeyStore { source })
    }

    /// Removes a key. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyStore`] if the store fails.
    #[instrument(name = "KeyLedger::delete", skip_all, fields(key_id = %id.masked()))]
    pub async fn delete(&self, id: &KeyId) -> Result<bool> {
        match self.store.write().await.delete(id).await {
            Ok(()) => {
                info!("Key deleted");
                Ok(true)
            }
            Err(KeyStoreError::NotFound) => Ok(false),
            Err(source) => Err(Error::KeyStore { source }),
        }
    }

    /// Converts the requested minutes to whole seconds and checks the bounds.
    fn duration_secs(&self, minutes: f64) -> Result<i64> {
        if !minutes.is_finite() {
            return Err(self.invalid_duration(minutes));
        }

        let secs = (minutes * 60.0).round();
        let min_secs = (self.policy.min_minutes * 60.0).round();
        let max_secs = (self.policy.max_minutes * 60.0).round();
        if secs < min_secs || secs > max_secs {
            return Err(self.invalid_duration(minutes));
        }

        #[allow(clippy::cast_possible_truncation)]
        Ok(secs as i64)
    }

    fn invalid_duration(&self, minutes: f64) -> Error {
        Error::InvalidDuration {
            minutes,
            min_minutes: self.policy.min_minutes,
            max_minutes: self.policy.max_minutes,
        }
    }
}

impl std::fmt::Debug for KeyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLedger")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
