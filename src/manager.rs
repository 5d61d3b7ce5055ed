//! Lazily established, shared mailbox connection.
//!
//! A [`ConnectionManager`] owns at most one live [`MailboxConnection`] and at
//! most one in-flight connection attempt. Concurrent callers of
//! [`acquire`](ConnectionManager::acquire) share that attempt and its outcome,
//! so a burst of requests opens a single transport connection. Any failure on
//! the connection discards it; the next `acquire` starts over.

use crate::config::MailboxConfig;
use crate::error::{Error, Result};
use crate::mailbox::{BodyRequest, CandidateMessage, MailSession, MailStore, MailboxStatus};
use crate::window::SearchWindow;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, instrument, warn};

type AttemptOutcome<S> = std::result::Result<Arc<MailboxConnection<S>>, Arc<Error>>;
type PendingAttempt<S> = Shared<BoxFuture<'static, AttemptOutcome<S>>>;

/// An authenticated session with its folder selected.
///
/// Commands are serialized through an async mutex around the session. Once
/// marked closed, a connection is never handed out again.
pub struct MailboxConnection<S> {
    session: tokio::sync::Mutex<S>,
    closed: AtomicBool,
    initial_next_uid: Option<u32>,
}

impl<S> MailboxConnection<S> {
    fn new(session: S, initial_next_uid: Option<u32>) -> Self {
        Self {
            session: tokio::sync::Mutex::new(session),
            closed: AtomicBool::new(false),
            initial_next_uid,
        }
    }

    /// Returns `false` once the connection failed or was discarded.
    ///
    /// The session does not surface an unsolicited `BYE` or EOF, so a connection
    /// dropped by the server still reports open until the next command on it
    /// fails.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// UIDNEXT reported when the folder was first selected.
    #[must_use]
    pub fn initial_next_uid(&self) -> Option<u32> {
        self.initial_next_uid
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl<S> std::fmt::Debug for MailboxConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxConnection")
            .field("open", &self.is_open())
            .field("initial_next_uid", &self.initial_next_uid)
            .finish_non_exhaustive()
    }
}

struct ManagerState<S> {
    live: Option<Arc<MailboxConnection<S>>>,
    pending: Option<(u64, PendingAttempt<S>)>,
    next_generation: u64,
}

/// Owns the mailbox connection shared by every retrieval.
///
/// # Example
///
/// ```no_run
/// use otp_keygate::{ConnectionManager, ImapMailStore, MailboxConfig};
///
/// # async fn example() -> otp_keygate::Result<()> {
/// let config = MailboxConfig::builder()
///     .email("user@gmail.com")
///     .password("app-password")
///     .sender("no-reply@service.example")
///     .build()?;
///
/// let manager = ConnectionManager::new(ImapMailStore::new(config.clone()), &config);
/// let connection = manager.acquire().await?;
/// let status = manager.open(&connection).await?;
/// println!("next UID: {:?}", status.next_uid);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager<M: MailStore> {
    store: Arc<M>,
    folder: String,
    logout_timeout: Duration,
    state: Mutex<ManagerState<M::Session>>,
    watermark: AtomicU32,
}

impl<M: MailStore> ConnectionManager<M> {
    /// Creates a manager that connects through `store` and selects `config.folder`.
    ///
    /// No connection is opened until the first [`acquire`](Self::acquire).
    pub fn new(store: M, config: &MailboxConfig) -> Self {
        Self {
            store: Arc::new(store),
            folder: config.folder.clone(),
            logout_timeout: config.timeouts.logout,
            state: Mutex::new(ManagerState {
                live: None,
                pending: None,
                next_generation: 0,
            }),
            watermark: AtomicU32::new(0),
        }
    }

    /// Returns the live connection, establishing one if needed.
    ///
    /// When an attempt is already in flight this waits for it instead of
    /// starting another one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectFailed`] wrapping the attempt's failure. Every
    /// caller that shared the attempt receives the same failure.
    #[instrument(name = "ConnectionManager::acquire", skip(self))]
    pub async fn acquire(&self) -> Result<Arc<MailboxConnection<M::Session>>> {
        let (generation, attempt) = {
            let mut state = self.lock_state();

            if let Some(live) = &state.live {
                if live.is_open() {
                    return Ok(Arc::clone(live));
                }
                state.live = None;
            }

            let joined = state
                .pending
                .as_ref()
                .map(|(generation, attempt)| (*generation, attempt.clone()));

            match joined {
                Some((generation, attempt)) => {
                    debug!(generation, "Joining pending connection attempt");
                    (generation, attempt)
                }
                None => {
                    let generation = state.next_generation;
                    state.next_generation += 1;
                    let attempt = self.start_attempt();
                    state.pending = Some((generation, attempt.clone()));
                    debug!(generation, "Started connection attempt");
                    (generation, attempt)
                }
            }
        };

        let outcome = attempt.await;

        let mut state = self.lock_state();
        let current = matches!(&state.pending, Some((pending, _)) if *pending == generation);
        if current {
            state.pending = None;
        }

        match outcome {
            Ok(connection) => {
                // An attempt discarded by reset() is handed back but not installed
                if current && connection.is_open() {
                    if let Some(next) = connection.initial_next_uid.filter(|next| *next > 0) {
                        self.watermark.store(next - 1, Ordering::Release);
                    }
                    state.live = Some(Arc::clone(&connection));
                    debug!(
                        generation,
                        watermark = self.watermark(),
                        "Mailbox connection ready"
                    );
                }
                Ok(connection)
            }
            Err(source) => Err(Error::ConnectFailed { source }),
        }
    }

    /// Discards the live connection and any pending attempt.
    ///
    /// A discarded session is logged out in the background; failures there are
    /// only logged. Calling this repeatedly is harmless.
    pub fn reset(&self) {
        let (live, pending) = {
            let mut state = self.lock_state();
            (state.live.take(), state.pending.take())
        };

        if pending.is_some() {
            debug!("Discarded pending connection attempt");
        }

        if let Some(connection) = live {
            connection.mark_closed();
            debug!("Discarded mailbox connection");
            self.spawn_logout(connection);
        }
    }

    /// Re-selects the folder on `connection` to read its current state.
    ///
    /// # Errors
    ///
    /// Returns the session's error after resetting the manager.
    #[instrument(name = "ConnectionManager::open", skip_all, fields(folder = %self.folder))]
    pub async fn open(&self, connection: &MailboxConnection<M::Session>) -> Result<MailboxStatus> {
        let result = {
            let mut session = connection.session.lock().await;
            session.open(&self.folder).await
        };
        self.reset_on_failure(connection, &result);
        result
    }

    /// Returns the messages inside `window` without marking them seen.
    ///
    /// # Errors
    ///
    /// Returns the session's error after resetting the manager.
    #[instrument(
        name = "ConnectionManager::search",
        skip_all,
        fields(uid_range = %window.uid_range(), body = ?body)
    )]
    pub async fn search(
        &self,
        connection: &MailboxConnection<M::Session>,
        window: &SearchWindow,
        body: BodyRequest,
    ) -> Result<Vec<CandidateMessage>> {
        let result = {
            let mut session = connection.session.lock().await;
            session.search(window, body).await
        };
        self.reset_on_failure(connection, &result);
        result
    }

    /// Highest UID observed so far.
    #[must_use]
    pub fn watermark(&self) -> u32 {
        self.watermark.load(Ordering::Acquire)
    }

    /// Raises the watermark to `uid` if it is higher.
    pub fn observe_uid(&self, uid: u32) {
        self.watermark.fetch_max(uid, Ordering::AcqRel);
    }

    /// Returns `true` when an open connection is installed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock_state()
            .live
            .as_ref()
            .is_some_and(|live| live.is_open())
    }

    /// The folder selected on every connection.
    #[must_use]
    pub fn folder(&self) -> &str {
        &self.folder
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private methods
    // ─────────────────────────────────────────────────────────────────────────

    fn lock_state(&self) -> MutexGuard<'_, ManagerState<M::Session>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_attempt(&self) -> PendingAttempt<M::Session> {
        let store = Arc::clone(&self.store);
        let folder = self.folder.clone();

        async move {
            let mut session = store.connect().await.map_err(|e| {
                warn!(error = %e, "Mailbox connection failed");
                Arc::new(e)
            })?;

            let status = session.open(&folder).await.map_err(|e| {
                warn!(error = %e, folder = %folder, "Selecting folder failed");
                Arc::new(e)
            })?;

            Ok(Arc::new(MailboxConnection::new(session, status.next_uid)))
        }
        .boxed()
        .shared()
    }

    fn reset_on_failure<T>(
        &self,
        connection: &MailboxConnection<M::Session>,
        result: &Result<T>,
    ) {
        if let Err(e) = result {
            warn!(error = %e, category = %e.category(), "Mailbox operation failed, resetting");
            connection.mark_closed();
            self.reset();
        }
    }

    fn spawn_logout(&self, connection: Arc<MailboxConnection<M::Session>>) {
        let logout_timeout = self.logout_timeout;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let logout = async {
                        let mut session = connection.session.lock().await;
                        session.logout().await
                    };
                    match tokio::time::timeout(logout_timeout, logout).await {
                        Ok(Ok(())) => debug!("Discarded session logged out"),
                        Ok(Err(e)) => debug!(error = %e, "Discarded session logout failed"),
                        Err(_) => debug!(
                            timeout_ms = logout_timeout.as_millis(),
                            "Discarded session logout timed out"
                        ),
                    }
                });
            }
            Err(_) => {
                warn!("Mailbox connection discarded outside of a tokio runtime, closing without logout");
            }
        }
    }
}

impl<M: MailStore> std::fmt::Debug for ConnectionManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("folder", &self.folder)
            .field("connected", &self.is_connected())
            .field("watermark", &self.watermark())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        logouts: AtomicUsize,
    }

    struct FakeStore {
        counters: Arc<Counters>,
        connect_delay: Duration,
        fail_connect: bool,
        fail_search: bool,
        next_uid: Option<u32>,
    }

    impl FakeStore {
        fn new(counters: &Arc<Counters>) -> Self {
            Self {
                counters: Arc::clone(counters),
                connect_delay: Duration::from_millis(50),
                fail_connect: false,
                fail_search: false,
                next_uid: Some(101),
            }
        }
    }

    struct FakeSession {
        counters: Arc<Counters>,
        fail_search: bool,
        next_uid: Option<u32>,
    }

    #[async_trait]
    impl MailSession for FakeSession {
        async fn open(&mut self, _folder: &str) -> Result<MailboxStatus> {
            Ok(MailboxStatus {
                next_uid: self.next_uid,
                exists: 3,
            })
        }

        async fn search(
            &mut self,
            window: &SearchWindow,
            _body: BodyRequest,
        ) -> Result<Vec<CandidateMessage>> {
            if self.fail_search {
                return Err(Error::SearchTimeout {
                    query: window.imap_query(),
                    timeout: Duration::from_secs(10),
                });
            }
            Ok(Vec::new())
        }

        async fn logout(&mut self) -> Result<()> {
            self.counters.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl MailStore for FakeStore {
        type Session = FakeSession;

        async fn connect(&self) -> Result<FakeSession> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.connect_delay).await;
            if self.fail_connect {
                return Err(Error::TcpConnect {
                    target: "imap.example.com:993".into(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                });
            }
            Ok(FakeSession {
                counters: Arc::clone(&self.counters),
                fail_search: self.fail_search,
                next_uid: self.next_uid,
            })
        }
    }

    fn config() -> MailboxConfig {
        MailboxConfig::builder()
            .email("reader@example.com")
            .password("secret")
            .sender("codes@example.com")
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_connects_once() {
        let counters = Arc::new(Counters::default());
        let manager = ConnectionManager::new(FakeStore::new(&counters), &config());

        let (a, b, c) = tokio::join!(manager.acquire(), manager.acquire(), manager.acquire());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert!(manager.is_connected());
        assert_eq!(manager.watermark(), 100);

        // The live connection is reused
        let d = manager.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&a, &d));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_discards_pending_attempt() {
        let counters = Arc::new(Counters::default());
        let manager = ConnectionManager::new(FakeStore::new(&counters), &config());

        let reset_midway = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.reset();
        };
        let (first, ()) = tokio::join!(manager.acquire(), reset_midway);

        // Handed back to the caller, but never installed
        let first = first.unwrap();
        assert!(!manager.is_connected());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);

        let second = manager.acquire().await.unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
        assert!(manager.is_connected());
        assert!(!Arc::ptr_eq(&first, &second));

        let third = manager.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_reaches_every_awaiter() {
        let counters = Arc::new(Counters::default());
        let store = FakeStore {
            fail_connect: true,
            ..FakeStore::new(&counters)
        };
        let manager = ConnectionManager::new(store, &config());

        let (a, b) = tokio::join!(manager.acquire(), manager.acquire());
        assert!(matches!(a, Err(Error::ConnectFailed { .. })));
        assert!(matches!(b, Err(Error::ConnectFailed { .. })));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert!(!manager.is_connected());

        // The failed attempt is cleared, the next call tries again
        assert!(manager.acquire().await.is_err());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_is_idempotent_and_logs_out() {
        let counters = Arc::new(Counters::default());
        let manager = ConnectionManager::new(FakeStore::new(&counters), &config());

        manager.reset();

        let first = manager.acquire().await.unwrap();
        manager.reset();
        manager.reset();
        assert!(!first.is_open());
        assert!(!manager.is_connected());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counters.logouts.load(Ordering::SeqCst), 1);

        let second = manager.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_failure_resets() {
        let counters = Arc::new(Counters::default());
        let store = FakeStore {
            fail_search: true,
            ..FakeStore::new(&counters)
        };
        let manager = ConnectionManager::new(store, &config());

        let connection = manager.acquire().await.unwrap();
        let window = SearchWindow::select(Some(101), 0, 12, "codes@example.com");
        let result = manager
            .search(&connection, &window, BodyRequest::Text)
            .await;

        assert!(matches!(result, Err(Error::SearchTimeout { .. })));
        assert!(!connection.is_open());
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watermark_only_rises() {
        let counters = Arc::new(Counters::default());
        let store = FakeStore {
            next_uid: None,
            ..FakeStore::new(&counters)
        };
        let manager = ConnectionManager::new(store, &config());

        manager.acquire().await.unwrap();
        assert_eq!(manager.watermark(), 0);

        manager.observe_uid(40);
        manager.observe_uid(12);
        assert_eq!(manager.watermark(), 40);
    }
}
