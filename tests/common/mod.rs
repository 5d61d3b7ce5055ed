//! Scripted in-memory mail store shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use otp_keygate::{
    AccessKey, BodyRequest, CandidateMessage, CodeRetriever, Error, HashmapKeyStore, KeyId,
    KeyLedger, KeyPolicy, KeyStore, MailSession, MailStore, MailboxConfig, MailboxStatus, OtpGate,
    Result, SearchWindow,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

pub const SENDER: &str = "codes@service.example";

// ─────────────────────────────────────────────────────────────────────────────
// Scripted mailbox
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub uid: u32,
    pub sender: String,
    pub text: Option<String>,
    pub raw: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct InboxState {
    pub messages: Vec<StoredMessage>,
    pub next_uid: u32,
    pub report_next_uid: bool,
    pub connects: usize,
    pub text_searches: usize,
    pub full_searches: usize,
    pub logouts: usize,
    pub fail_next_connects: usize,
    pub fail_next_searches: usize,
}

/// Handle to a mailbox that tests mutate while retrievals run.
#[derive(Debug, Clone)]
pub struct Inbox(Arc<Mutex<InboxState>>);

impl Inbox {
    pub fn new() -> Self {
        Inbox(Arc::new(Mutex::new(InboxState {
            next_uid: 1,
            report_next_uid: true,
            ..InboxState::default()
        })))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut InboxState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    /// Delivers a message whose text section is `text`, returning its UID.
    pub fn deliver_text(&self, sender: &str, text: &str) -> u32 {
        let raw = format!("From: {sender}\r\nSubject: Your code\r\n\r\n{text}");
        self.deliver(sender, Some(text.to_string()), Some(raw.into_bytes()))
    }

    /// Delivers a message with distinct text section and raw form.
    pub fn deliver(&self, sender: &str, text: Option<String>, raw: Option<Vec<u8>>) -> u32 {
        self.with(|state| {
            let uid = state.next_uid;
            state.next_uid += 1;
            state.messages.push(StoredMessage {
                uid,
                sender: sender.to_string(),
                text,
                raw,
            });
            uid
        })
    }

    /// Skips UIDs as if other mail had arrived and been expunged.
    pub fn advance_uid(&self, count: u32) {
        self.with(|state| state.next_uid += count);
    }

    pub fn connects(&self) -> usize {
        self.with(|state| state.connects)
    }

    pub fn full_searches(&self) -> usize {
        self.with(|state| state.full_searches)
    }

    pub fn text_searches(&self) -> usize {
        self.with(|state| state.text_searches)
    }
}

pub struct ScriptedStore {
    inbox: Inbox,
}

impl ScriptedStore {
    pub fn new(inbox: &Inbox) -> Self {
        Self {
            inbox: inbox.clone(),
        }
    }
}

pub struct ScriptedSession {
    inbox: Inbox,
}

#[async_trait]
impl MailStore for ScriptedStore {
    type Session = ScriptedSession;

    async fn connect(&self) -> Result<ScriptedSession> {
        let refused = self.inbox.with(|state| {
            state.connects += 1;
            if state.fail_next_connects > 0 {
                state.fail_next_connects -= 1;
                true
            } else {
                false
            }
        });
        // Give concurrent callers a chance to pile up on the pending attempt
        tokio::time::sleep(Duration::from_millis(20)).await;

        if refused {
            return Err(Error::TcpConnect {
                target: "imap.service.example:993".into(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        Ok(ScriptedSession {
            inbox: self.inbox.clone(),
        })
    }
}

#[async_trait]
impl MailSession for ScriptedSession {
    async fn open(&mut self, _folder: &str) -> Result<MailboxStatus> {
        Ok(self.inbox.with(|state| MailboxStatus {
            next_uid: state.report_next_uid.then_some(state.next_uid),
            exists: u32::try_from(state.messages.len()).unwrap(),
        }))
    }

    async fn search(
        &mut self,
        window: &SearchWindow,
        body: BodyRequest,
    ) -> Result<Vec<CandidateMessage>> {
        self.inbox.with(|state| {
            if state.fail_next_searches > 0 {
                state.fail_next_searches -= 1;
                return Err(Error::SearchTimeout {
                    query: window.imap_query(),
                    timeout: Duration::from_secs(10),
                });
            }

            match body {
                BodyRequest::Text => state.text_searches += 1,
                BodyRequest::Full => state.full_searches += 1,
            }

            Ok(state
                .messages
                .iter()
                .filter(|m| m.uid >= window.lower && m.uid <= window.upper)
                .filter(|m| m.sender.eq_ignore_ascii_case(&window.sender))
                .map(|m| CandidateMessage {
                    uid: m.uid,
                    sender: Some(m.sender.clone()),
                    body: match body {
                        BodyRequest::Text => m.text.clone().map(String::into_bytes),
                        BodyRequest::Full => m.raw.clone(),
                    },
                })
                .collect())
        })
    }

    async fn logout(&mut self) -> Result<()> {
        self.inbox.with(|state| state.logouts += 1);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring helpers
// ─────────────────────────────────────────────────────────────────────────────

pub fn mailbox_config() -> MailboxConfig {
    MailboxConfig::builder()
        .email("reader@service.example")
        .password("app-password")
        .sender(SENDER)
        .build()
        .unwrap()
}

pub fn retriever(inbox: &Inbox) -> CodeRetriever<ScriptedStore> {
    CodeRetriever::new(ScriptedStore::new(inbox), &mailbox_config())
}

pub type SharedKeys = Arc<RwLock<HashmapKeyStore>>;

pub fn gate(inbox: &Inbox) -> (OtpGate<ScriptedStore>, SharedKeys) {
    let keys: SharedKeys = Arc::new(RwLock::new(HashmapKeyStore::default()));
    let ledger = KeyLedger::new(keys.clone(), KeyPolicy::default());
    (OtpGate::new(ledger, retriever(inbox)), keys)
}

pub async fn insert_key(keys: &SharedKeys, id: &str, uses_left: u32, minutes: i64) -> AccessKey {
    let key = AccessKey::new(KeyId::new(id), uses_left, chrono::Utc::now(), minutes * 60).unwrap();
    keys.write().await.create(key.clone()).await.unwrap();
    key
}

pub async fn uses_left(keys: &SharedKeys, id: &str) -> Option<u32> {
    keys.read()
        .await
        .find(&KeyId::new(id))
        .await
        .ok()
        .map(|key| key.uses_left)
}
