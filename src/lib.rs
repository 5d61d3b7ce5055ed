//! # otp-keygate
//!
//! Hands out one-time codes delivered by email to holders of time- and
//! use-limited access keys.
//!
//! The crate is built from a few layers:
//!
//! - [`extractor`] pulls a 6-digit code out of noisy email text
//! - [`SearchWindow`] picks the narrow UID range searched on each poll
//! - [`ConnectionManager`] keeps one lazily established mailbox connection
//!   shared by every concurrent request
//! - [`CodeRetriever`] polls the mailbox until a code arrives or the deadline passes
//! - [`KeyLedger`] validates keys and charges one use per retrieval
//! - [`OtpGate`] ties the ledger to the retriever, [`server`] exposes it over HTTP
//!
//! ## Quick Start
//!
//! ```no_run
//! use otp_keygate::{
//!     CodeRetriever, HashmapKeyStore, ImapMailStore, KeyLedger, KeyPolicy, MailboxConfig,
//!     OtpGate,
//! };
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//!
//! # async fn example() -> otp_keygate::Result<()> {
//! let config = MailboxConfig::builder()
//!     .email("user@gmail.com")
//!     .password("app-password")  // Use app-specific password for Gmail
//!     .sender("no-reply@service.example")
//!     .build()?;
//!
//! let ledger = KeyLedger::new(
//!     Arc::new(RwLock::new(HashmapKeyStore::default())),
//!     KeyPolicy::default(),
//! );
//! let key = ledger.create(Some(30.0)).await?;
//!
//! let retriever = CodeRetriever::new(ImapMailStore::new(config.clone()), &config);
//! let gate = OtpGate::new(ledger, retriever);
//!
//! // Waits up to 20 seconds for the code, then charges the key
//! let response = gate.retrieve(key.id.as_str()).await;
//! println!("{response:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All errors implement `std::error::Error` and provide context. Mailbox errors
//! never reach callers of [`OtpGate`]: the retrieval loop resets the connection
//! and tries again until its deadline. Use [`Error::is_retryable`] and
//! [`Error::category`] when driving the lower layers directly:
//!
//! ```
//! use otp_keygate::Error;
//!
//! fn handle_error(error: &Error) {
//!     if error.is_retryable() {
//!         println!("Transient error, can retry: {}", error);
//!     } else {
//!         println!("Permanent error: {}", error);
//!     }
//! }
//! ```
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation.
//!
//! ### Span Naming Convention
//!
//! - `OtpGate::retrieve` - One request: validate, retrieve, charge
//! - `CodeRetriever::retrieve` - The polling loop
//! - `ConnectionManager::acquire` / `open` / `search` - Shared connection use
//! - `KeyLedger::validate` / `charge` / `create` / `delete` - Key accounting
//! - `session::connect` / `authenticate` / `select` / `search` / `fetch` / `logout` - IMAP
//! - `connection::establish` - Transport connection
//!
//! ### Standard Fields
//!
//! - `email` - Mailbox account
//! - `imap_host` - IMAP server hostname
//! - `uid` / `uid_range` - Message UIDs
//! - `key_id` - Access key, masked to its last four digits

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod config;
pub mod error;
pub mod extractor;
pub mod gate;
pub mod key_store;
pub mod ledger;
pub mod mailbox;
pub mod manager;
pub mod retrieval;
pub mod server;
pub mod window;

// Internal modules
mod connection;
mod parser;
mod session;

// Re-exports for ergonomic API
pub use config::{
    KeyPolicy, MailboxConfig, MailboxConfigBuilder, PollingConfig, ServiceConfig, TimeoutConfig,
};
pub use email_address::EmailAddress;
pub use error::{Error, ErrorCategory, Result};
pub use extractor::{extract_code, OtpCode};
pub use gate::{GateResponse, OtpGate};
pub use key_store::{AccessKey, HashmapKeyStore, KeyId, KeyStore, KeyStoreError};
pub use ledger::KeyLedger;
pub use mailbox::{BodyRequest, CandidateMessage, MailSession, MailStore, MailboxStatus};
pub use manager::{ConnectionManager, MailboxConnection};
pub use retrieval::{CodeRetriever, Retrieval};
pub use session::{ImapMailStore, ImapSession};
pub use window::SearchWindow;
