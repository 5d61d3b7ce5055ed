//! The request path: validate a key, wait for a code, charge the key.

use crate::error::Error;
use crate::key_store::KeyId;
use crate::ledger::KeyLedger;
use crate::mailbox::MailStore;
use crate::retrieval::{CodeRetriever, Retrieval};
use serde::Serialize;
use tracing::{error, info, instrument};

/// Reply when no key was presented.
pub const MSG_KEY_REQUIRED: &str = "Key required";
/// Reply for an unknown key.
pub const MSG_INVALID_KEY: &str = "Invalid key";
/// Reply for a key past its expiry.
pub const MSG_KEY_EXPIRED: &str = "Key has expired";
/// Reply for a key with no uses left.
pub const MSG_KEY_EXHAUSTED: &str = "Key has no uses left";
/// Reply when no code arrived before the deadline.
pub const MSG_CODE_NOT_FOUND: &str = "Code not found";
/// Reply when the key store itself failed.
pub const MSG_UNAVAILABLE: &str = "Service temporarily unavailable";

/// What a caller of [`OtpGate::retrieve`] gets back.
///
/// Serializes as `{"code": "..."}` or `{"message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum GateResponse {
    /// The code that arrived.
    Code {
        /// Six ASCII digits.
        code: String,
    },
    /// Why no code is returned.
    Message {
        /// Human readable reason.
        message: String,
    },
}

impl GateResponse {
    fn message(message: &str) -> Self {
        GateResponse::Message {
            message: message.to_string(),
        }
    }

    /// The code, if one was found.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            GateResponse::Code { code } => Some(code),
            GateResponse::Message { .. } => None,
        }
    }
}

/// Ties the [`KeyLedger`] to a [`CodeRetriever`].
pub struct OtpGate<M: MailStore> {
    ledger: KeyLedger,
    retriever: CodeRetriever<M>,
}

impl<M: MailStore> OtpGate<M> {
    /// Creates a gate.
    pub fn new(ledger: KeyLedger, retriever: CodeRetriever<M>) -> Self {
        Self { ledger, retriever }
    }

    /// Validates `presented_key`, waits for a code and charges the key once.
    ///
    /// The charge happens whether or not a code was found. Keys that fail
    /// validation are not charged.
    ///
    /// Validation and charging take the ledger lock separately, so concurrent
    /// requests on a key with one use left may all be served. This is accepted;
    /// the use count never drops below zero.
    #[instrument(name = "OtpGate::retrieve", skip_all)]
    pub async fn retrieve(&self, presented_key: &str) -> GateResponse {
        let presented_key = presented_key.trim();
        if presented_key.is_empty() {
            return GateResponse::message(MSG_KEY_REQUIRED);
        }

        let key_id = KeyId::new(presented_key);
        if let Err(e) = self.ledger.validate(&key_id).await {
            return Self::rejection(&e);
        }

        let retrieval = self.retriever.retrieve().await;

        match self.ledger.charge(&key_id).await {
            Ok(uses_left) => info!(
                key_id = %key_id.masked(),
                uses_left,
                found = retrieval.is_found(),
                "Retrieval finished"
            ),
            Err(e) => error!(key_id = %key_id.masked(), error = %e, "Failed to charge key"),
        }

        match retrieval {
            Retrieval::Found(code) => GateResponse::Code {
                code: code.into_string(),
            },
            Retrieval::NotFound => GateResponse::message(MSG_CODE_NOT_FOUND),
        }
    }

    /// The key ledger, for administration.
    #[must_use]
    pub fn ledger(&self) -> &KeyLedger {
        &self.ledger
    }

    /// The code retriever.
    #[must_use]
    pub fn retriever(&self) -> &CodeRetriever<M> {
        &self.retriever
    }

    fn rejection(error: &Error) -> GateResponse {
        match error {
            Error::InvalidKey => GateResponse::message(MSG_INVALID_KEY),
            Error::KeyExpired => GateResponse::message(MSG_KEY_EXPIRED),
            Error::KeyExhausted => GateResponse::message(MSG_KEY_EXHAUSTED),
            other => {
                error!(error = %other, "Key validation failed");
                GateResponse::message(MSG_UNAVAILABLE)
            }
        }
    }
}

impl<M: MailStore> std::fmt::Debug for OtpGate<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpGate")
            .field("ledger", &self.ledger)
            .field("retriever", &self.retriever)
            .finish()
    }
}
