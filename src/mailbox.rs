//! The boundary between the retrieval engine and the mail store.
//!
//! [`MailStore`] opens sessions; a [`MailSession`] selects a folder and searches
//! it. The IMAP implementation lives in [`ImapMailStore`](crate::ImapMailStore);
//! tests plug in scripted stores.

use crate::error::Result;
use crate::window::SearchWindow;
use async_trait::async_trait;

/// Which part of each message a search should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyRequest {
    /// Only the text section (`BODY.PEEK[TEXT]`), cheap to fetch.
    Text,
    /// The complete raw RFC 5322 message (`BODY.PEEK[]`).
    Full,
}

/// State of a folder right after it was selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Next UID the server will assign, if reported.
    pub next_uid: Option<u32>,
    /// Number of messages in the folder.
    pub exists: u32,
}

/// A message returned by a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateMessage {
    /// UID assigned by the mail store.
    pub uid: u32,
    /// First `From` address of the envelope, if any.
    pub sender: Option<String>,
    /// The requested section: the text part or the whole raw message.
    pub body: Option<Vec<u8>>,
}

impl CandidateMessage {
    /// The body decoded as (lossy) UTF-8.
    #[must_use]
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

/// A live, authenticated session with the mail store.
///
/// Implementations must never mark messages as read.
#[async_trait]
pub trait MailSession: Send + 'static {
    /// Selects `folder` and reports its status.
    async fn open(&mut self, folder: &str) -> Result<MailboxStatus>;

    /// Returns the messages inside `window`, with the section named by `body`.
    async fn search(
        &mut self,
        window: &SearchWindow,
        body: BodyRequest,
    ) -> Result<Vec<CandidateMessage>>;

    /// Ends the session.
    async fn logout(&mut self) -> Result<()>;
}

/// Factory for [`MailSession`]s.
#[async_trait]
pub trait MailStore: Send + Sync + 'static {
    /// Session type produced by [`connect`](Self::connect).
    type Session: MailSession;

    /// Opens and authenticates a new session.
    async fn connect(&self) -> Result<Self::Session>;
}
