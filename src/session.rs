//! IMAP implementation of the mail store boundary.
//!
//! This module wraps async-imap operations with proper error handling and a
//! timeout per operation.

use crate::config::{MailboxConfig, TimeoutConfig};
use crate::connection::{self, BoxedStream, TransportSecurity};
use crate::error::{Error, Result};
use crate::mailbox::{BodyRequest, CandidateMessage, MailSession, MailStore, MailboxStatus};
use crate::window::SearchWindow;
use async_imap::types::Fetch;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, instrument};

type RawSession = async_imap::Session<BoxedStream>;

/// Opens authenticated IMAP sessions for one mailbox account.
///
/// # Example
///
/// ```no_run
/// use otp_keygate::{ImapMailStore, MailboxConfig, MailStore};
///
/// # async fn example() -> otp_keygate::Result<()> {
/// let config = MailboxConfig::builder()
///     .email("user@gmail.com")
///     .password("app-password")
///     .sender("no-reply@service.example")
///     .build()?;
///
/// let store = ImapMailStore::new(config);
/// let session = store.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ImapMailStore {
    config: MailboxConfig,
}

impl ImapMailStore {
    /// Creates a store for the account described by `config`.
    #[must_use]
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration sessions are opened with.
    #[must_use]
    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }
}

#[async_trait]
impl MailStore for ImapMailStore {
    type Session = ImapSession;

    #[instrument(
        name = "session::connect",
        skip_all,
        fields(
            email = %self.config.email(),
            imap_host = %self.config.imap_host
        )
    )]
    async fn connect(&self) -> Result<ImapSession> {
        let config = &self.config;
        let target_addr = config.server_address();
        let timeouts = &config.timeouts;
        let security = TransportSecurity {
            tls: config.tls,
            accept_invalid_certs: config.accept_invalid_certs,
        };

        let stream = tokio::time::timeout(
            timeouts.connect,
            connection::establish_connection(&config.imap_host, &target_addr, security),
        )
        .await
        .map_err(|_| Error::ConnectTimeout {
            target: target_addr.clone(),
            timeout: timeouts.connect,
        })??;

        debug!("Transport connection established");

        let session = tokio::time::timeout(
            timeouts.auth,
            authenticate(stream, config.email(), config.password()),
        )
        .await
        .map_err(|_| Error::AuthTimeout {
            email: config.email().to_string(),
            timeout: timeouts.auth,
        })??;

        debug!("Authenticated");

        Ok(ImapSession {
            inner: session,
            timeouts: timeouts.clone(),
        })
    }
}

/// An authenticated IMAP session.
pub struct ImapSession {
    inner: RawSession,
    timeouts: TimeoutConfig,
}

impl std::fmt::Debug for ImapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSession")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn open(&mut self, folder: &str) -> Result<MailboxStatus> {
        let timeout = self.timeouts.select;

        tokio::time::timeout(timeout, select_mailbox(&mut self.inner, folder))
            .await
            .map_err(|_| Error::SelectTimeout {
                mailbox: folder.to_string(),
                timeout,
            })?
    }

    async fn search(
        &mut self,
        window: &SearchWindow,
        body: BodyRequest,
    ) -> Result<Vec<CandidateMessage>> {
        let query = window.imap_query();
        let search_timeout = self.timeouts.search;

        let uids = tokio::time::timeout(search_timeout, search_uids(&mut self.inner, &query))
            .await
            .map_err(|_| Error::SearchTimeout {
                query: query.clone(),
                timeout: search_timeout,
            })??;

        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let uid_set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetch_timeout = self.timeouts.fetch;

        tokio::time::timeout(fetch_timeout, fetch_messages(&mut self.inner, &uid_set, body))
            .await
            .map_err(|_| Error::FetchTimeout {
                uid_range: uid_set.clone(),
                timeout: fetch_timeout,
            })?
    }

    async fn logout(&mut self) -> Result<()> {
        let timeout = self.timeouts.logout;

        tokio::time::timeout(timeout, logout(&mut self.inner))
            .await
            .map_err(|_| Error::LogoutTimeout { timeout })?
    }
}

/// Authenticates to IMAP server and returns a session.
#[instrument(name = "session::authenticate", skip_all, fields(email = %email))]
async fn authenticate(stream: BoxedStream, email: &str, password: &str) -> Result<RawSession> {
    let client = async_imap::Client::new(stream);

    debug!("Authenticating to IMAP server");

    client
        .login(email, password)
        .await
        .map_err(|e| Error::ImapLogin {
            email: email.to_string(),
            source: e.0,
        })
}

/// Selects a mailbox and reports the UID the server will assign next.
#[instrument(name = "session::select", skip(session), fields(mailbox = %mailbox))]
async fn select_mailbox(session: &mut RawSession, mailbox: &str) -> Result<MailboxStatus> {
    debug!("Selecting mailbox");

    let selected = session
        .select(mailbox)
        .await
        .map_err(|source| Error::SelectMailbox {
            mailbox: mailbox.to_string(),
            source,
        })?;

    debug!(
        uid_next = ?selected.uid_next,
        exists = selected.exists,
        "Mailbox selected"
    );

    Ok(MailboxStatus {
        next_uid: selected.uid_next,
        exists: selected.exists,
    })
}

/// Runs a `UID SEARCH` and returns the matching UIDs in ascending order.
#[instrument(name = "session::search", skip(session), fields(query = %query))]
async fn search_uids(session: &mut RawSession, query: &str) -> Result<Vec<u32>> {
    let uids = session
        .uid_search(query)
        .await
        .map_err(|source| Error::ImapSearch {
            query: query.to_string(),
            source,
        })?;

    let mut uids: Vec<u32> = uids.into_iter().collect();
    uids.sort_unstable();

    debug!(uid_count = uids.len(), "Search finished");

    Ok(uids)
}

/// Fetches the requested section of each message without setting `\Seen`.
#[instrument(name = "session::fetch", skip(session), fields(uid_set = %uid_set))]
async fn fetch_messages(
    session: &mut RawSession,
    uid_set: &str,
    body: BodyRequest,
) -> Result<Vec<CandidateMessage>> {
    let query = match body {
        BodyRequest::Text => "(UID ENVELOPE BODY.PEEK[TEXT])",
        BodyRequest::Full => "(UID ENVELOPE BODY.PEEK[])",
    };

    let mut stream = session
        .uid_fetch(uid_set, query)
        .await
        .map_err(|source| Error::ImapFetch {
            uid_range: uid_set.to_string(),
            source,
        })?
        .boxed();

    let mut messages = Vec::new();
    while let Some(fetch) = stream.next().await {
        let fetch = fetch.map_err(|source| Error::FetchMessage { source })?;
        if let Some(message) = to_candidate(&fetch, body) {
            messages.push(message);
        }
    }

    debug!(message_count = messages.len(), "Fetched messages");

    Ok(messages)
}

/// Converts a fetch response; responses without a UID are unsolicited and dropped.
fn to_candidate(fetch: &Fetch, body: BodyRequest) -> Option<CandidateMessage> {
    let uid = fetch.uid?;

    let sender = fetch
        .envelope()
        .and_then(|envelope| envelope.from.as_ref())
        .and_then(|addresses| addresses.first())
        .and_then(|address| {
            let mailbox = address.mailbox.as_deref()?;
            let host = address.host.as_deref()?;
            Some(format!(
                "{}@{}",
                String::from_utf8_lossy(mailbox),
                String::from_utf8_lossy(host)
            ))
        });

    let section = match body {
        BodyRequest::Text => fetch.text(),
        BodyRequest::Full => fetch.body(),
    };

    Some(CandidateMessage {
        uid,
        sender,
        body: section.map(<[u8]>::to_vec),
    })
}

/// Logs out from IMAP session.
#[instrument(name = "session::logout", skip(session))]
async fn logout(session: &mut RawSession) -> Result<()> {
    debug!("Logging out");

    session
        .logout()
        .await
        .map_err(|source| Error::ImapLogout { source })?;

    Ok(())
}
