//! Polling loop that waits for a one-time code to arrive in the mailbox.
//!
//! Each tick acquires the shared connection, re-selects the folder, searches
//! the recent [`SearchWindow`] for messages from the configured sender and
//! runs the [`extractor`](crate::extractor) over each candidate, newest first.
//! When a poll returns only a few candidates, messages whose text section
//! yields nothing are fetched in full and parsed before giving up on them.
//!
//! # Example
//!
//! ```no_run
//! use otp_keygate::{CodeRetriever, ImapMailStore, MailboxConfig, Retrieval};
//!
//! # async fn example() -> otp_keygate::Result<()> {
//! let config = MailboxConfig::builder()
//!     .email("user@gmail.com")
//!     .password("app-password")
//!     .sender("no-reply@service.example")
//!     .build()?;
//!
//! let retriever = CodeRetriever::new(ImapMailStore::new(config.clone()), &config);
//! match retriever.retrieve().await {
//!     Retrieval::Found(code) => println!("Got code: {code}"),
//!     Retrieval::NotFound => println!("No code arrived in time"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::{MailboxConfig, PollingConfig};
use crate::error::Result;
use crate::extractor::{extract_code, OtpCode};
use crate::mailbox::{BodyRequest, MailStore};
use crate::manager::{ConnectionManager, MailboxConnection};
use crate::parser::{self, ExtractResult};
use crate::window::SearchWindow;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Outcome of one retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retrieval {
    /// A code was found before the deadline.
    Found(OtpCode),
    /// The deadline elapsed without a code.
    NotFound,
}

impl Retrieval {
    /// Returns `true` for [`Retrieval::Found`].
    #[must_use]
    pub fn is_found(&self) -> bool {
        matches!(self, Retrieval::Found(_))
    }

    /// The found code, if any.
    #[must_use]
    pub fn into_code(self) -> Option<OtpCode> {
        match self {
            Retrieval::Found(code) => Some(code),
            Retrieval::NotFound => None,
        }
    }
}

/// Waits for codes from one sender, sharing a single mailbox connection
/// between concurrent retrievals.
pub struct CodeRetriever<M: MailStore> {
    manager: ConnectionManager<M>,
    polling: PollingConfig,
    sender: String,
}

impl<M: MailStore> CodeRetriever<M> {
    /// Creates a retriever reading from `store` with the polling rules of `config`.
    pub fn new(store: M, config: &MailboxConfig) -> Self {
        Self {
            manager: ConnectionManager::new(store, config),
            polling: config.polling.clone(),
            sender: config.sender().to_string(),
        }
    }

    /// Polls with the configured deadline and interval.
    pub async fn retrieve(&self) -> Retrieval {
        self.retrieve_within(self.polling.max_wait, self.polling.interval)
            .await
    }

    /// Polls every `interval` until a code is found or `max_wait` elapses.
    ///
    /// Mailbox failures never escape: the connection is reset and the next
    /// tick tries again. The deadline bounds the loop; a poll already in
    /// flight when it passes is allowed to finish.
    #[instrument(
        name = "CodeRetriever::retrieve",
        skip(self),
        fields(sender = %self.sender)
    )]
    pub async fn retrieve_within(&self, max_wait: Duration, interval: Duration) -> Retrieval {
        let deadline = Instant::now() + max_wait;
        let mut polls = 0_u32;

        while Instant::now() < deadline {
            polls += 1;

            match self.poll().await {
                Ok(Some(code)) => {
                    info!(polls, "Code found");
                    return Retrieval::Found(code);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, polls, "Poll failed, resetting mailbox connection");
                    self.manager.reset();
                }
            }

            if Instant::now() < deadline {
                tokio::time::sleep(interval).await;
            }
        }

        info!(polls, max_wait_ms = max_wait.as_millis(), "No code before deadline");
        Retrieval::NotFound
    }

    /// The connection manager shared by every retrieval.
    #[must_use]
    pub fn manager(&self) -> &ConnectionManager<M> {
        &self.manager
    }

    /// The polling rules in effect.
    #[must_use]
    pub fn polling(&self) -> &PollingConfig {
        &self.polling
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private methods
    // ─────────────────────────────────────────────────────────────────────────

    /// One tick: search the window and inspect candidates newest first.
    async fn poll(&self) -> Result<Option<OtpCode>> {
        let connection = self.manager.acquire().await?;
        let status = self.manager.open(&connection).await?;

        let window = SearchWindow::select(
            status.next_uid,
            self.manager.watermark(),
            self.polling.window_span,
            &self.sender,
        );
        if window.is_empty() {
            debug!("Nothing to search yet");
            return Ok(None);
        }

        let mut candidates = self
            .manager
            .search(&connection, &window, BodyRequest::Text)
            .await?;
        candidates.sort_unstable_by(|a, b| b.uid.cmp(&a.uid));

        let allow_fallback = candidates.len() <= self.polling.fallback_threshold;

        debug!(
            uid_range = %window.uid_range(),
            candidates = candidates.len(),
            allow_fallback,
            "Searched window"
        );

        for candidate in &candidates {
            self.manager.observe_uid(candidate.uid);

            if let Some(code) = extract_code(candidate.body_text().as_deref()) {
                debug!(uid = candidate.uid, "Code found in text section");
                return Ok(Some(code));
            }

            if allow_fallback {
                if let Some(code) = self.fallback(&connection, candidate.uid).await? {
                    return Ok(Some(code));
                }
            }
        }

        Ok(None)
    }

    /// Fetches the full message for `uid` and extracts from its parsed bodies.
    async fn fallback(
        &self,
        connection: &MailboxConnection<M::Session>,
        uid: u32,
    ) -> Result<Option<OtpCode>> {
        let window = SearchWindow::single(uid, &self.sender);
        let messages = self
            .manager
            .search(connection, &window, BodyRequest::Full)
            .await?;

        for message in &messages {
            if let ExtractResult::Match(code) = parser::extract_code_from_full_message(message) {
                debug!(uid, "Code found in parsed message");
                return Ok(Some(code));
            }
        }

        Ok(None)
    }
}

impl<M: MailStore> std::fmt::Debug for CodeRetriever<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRetriever")
            .field("manager", &self.manager)
            .field("polling", &self.polling)
            .field("sender", &self.sender)
            .finish()
    }
}
