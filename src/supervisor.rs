//! Per-account connection supervisor
//!
//! Owns one account's connection lifecycle: connect with linear-backoff
//! retries, one-shot historical backfill, then the live-watch loop where a
//! periodic watchdog keep-alive and the mailbox event channel share a single
//! `select!` so at most one protocol operation is ever in flight on the
//! connection. Credential failures abort immediately; transient failures
//! self-heal through the watchdog. Every state transition writes one status
//! record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch as watch_channel;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::backfill::BackfillScanner;
use crate::config::AccountConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SyncError};
use crate::session::{MailSession, MailboxEvent, SessionFactory, INBOX};
use crate::status::{mask_user, AccountStatus, ConnectionState, StatusStore};
use crate::watch;

/// Supervisor tuning; see `config::SyncSettings` for the file-level knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Connect attempt ceiling per startup cycle
    pub connect_attempts: u32,
    /// Linear backoff step: the wait before attempt N+1 is N * step
    pub backoff_step: Duration,
    /// Keep-alive probe period
    pub watchdog_period: Duration,
    /// Historical backfill window
    pub backfill_days: i64,
    /// Bounded wait for an orderly logout
    pub logout_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            backoff_step: Duration::from_secs(2),
            watchdog_period: Duration::from_secs(29 * 60),
            backfill_days: 30,
            logout_grace: Duration::from_secs(5),
        }
    }
}

pub struct ConnectionSupervisor {
    account: AccountConfig,
    config: SupervisorConfig,
    factory: Arc<dyn SessionFactory>,
    store: StatusStore,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch_channel::Receiver<bool>,
}

impl ConnectionSupervisor {
    pub fn new(
        account: AccountConfig,
        config: SupervisorConfig,
        factory: Arc<dyn SessionFactory>,
        store: StatusStore,
        dispatcher: Arc<Dispatcher>,
        shutdown: watch_channel::Receiver<bool>,
    ) -> Self {
        Self {
            account,
            config,
            factory,
            store,
            dispatcher,
            shutdown,
        }
    }

    /// Drive the account from Disconnected to Watching and keep it there.
    /// Never panics and never takes the process down with it.
    pub async fn run(mut self) {
        let mut session = match self.connect_with_retry().await {
            Ok(session) => session,
            // Status already reflects the classified error; nothing to do
            // until the next process start or config change.
            Err(_) => return,
        };

        self.transition_backfilling().await;
        let scanner = BackfillScanner {
            window_days: self.config.backfill_days,
        };
        if let Err(e) = scanner
            .run(&self.account.id, session.as_mut(), &self.dispatcher)
            .await
        {
            warn!(account = %self.account.id, "backfill failed: {}", e);
        }

        // Completion always hands over to live watch, messages or not.
        self.watch_loop(session).await;
    }

    /// Connect phase: up to `connect_attempts` tries with linear backoff
    /// between attempts only. Auth failures abort without retrying.
    async fn connect_with_retry(&mut self) -> Result<Box<dyn MailSession>> {
        let id = self.account.id.clone();
        info!(account = %id, host = %self.account.host, "starting supervisor");
        self.store
            .set(&id, self.base_status(ConnectionState::Connecting, false, None))
            .await;

        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.factory.connect(&self.account).await {
                Ok(session) => {
                    info!(account = %id, attempt, "connected");
                    self.store
                        .set(&id, self.base_status(ConnectionState::Connected, true, None))
                        .await;
                    return Ok(session);
                }
                Err(e) if e.is_auth() => {
                    error!(account = %id, "authentication failed, not retrying: {}", e);
                    self.store
                        .set(
                            &id,
                            self.base_status(
                                ConnectionState::AuthFailed,
                                false,
                                Some(e.to_string()),
                            ),
                        )
                        .await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(account = %id, attempt, "connect attempt failed: {}", e);
                    if attempt == attempts {
                        error!(account = %id, attempts, "giving up on connect for this startup cycle");
                        self.store
                            .set(
                                &id,
                                self.base_status(
                                    ConnectionState::Disconnected,
                                    false,
                                    Some(e.to_string()),
                                ),
                            )
                            .await;
                        return Err(e);
                    }
                    let backoff = self.config.backoff_step * attempt;
                    debug!(account = %id, backoff_secs = backoff.as_secs(), "retrying connect");
                    if self.backoff_or_shutdown(backoff).await {
                        self.store
                            .set(&id, self.base_status(ConnectionState::Stopped, false, None))
                            .await;
                        return Err(SyncError::Shutdown);
                    }
                }
            }
        }
        unreachable!("connect loop returns on every branch")
    }

    /// Live-watch loop: mailbox events, the watchdog and shutdown share one
    /// select, serializing all work on the connection.
    async fn watch_loop(&mut self, session: Box<dyn MailSession>) {
        let mut session = Some(session);
        let mut events: Option<flume::Receiver<MailboxEvent>> = None;

        match self
            .start_watching(session.as_mut().expect("session present").as_mut())
            .await
        {
            Ok(rx) => events = Some(rx),
            Err(e) => {
                warn!(account = %self.account.id, "failed to start live watch: {}", e);
                self.set_reconnecting(e.to_string()).await;
                session = None;
            }
        }

        let mut shutdown = self.shutdown.clone();
        let mut watchdog = interval_at(
            Instant::now() + self.config.watchdog_period,
            self.config.watchdog_period,
        );

        loop {
            let rx = events.clone();
            let next_event = async move {
                match rx {
                    Some(rx) => rx.recv_async().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                ev = next_event => match ev {
                    Ok(MailboxEvent::Exists { count }) => {
                        debug!(account = %self.account.id, count, "mailbox size changed");
                        if let Some(live) = session.as_mut() {
                            if let Err(e) = watch::process_new_mail(
                                &self.account.id,
                                live.as_mut(),
                                &self.dispatcher,
                            )
                            .await
                            {
                                warn!(account = %self.account.id, "live update failed: {}", e);
                            }
                        }
                    }
                    Ok(MailboxEvent::ConnectionLost) | Err(_) => {
                        warn!(account = %self.account.id, "mailbox event channel closed");
                        // Leave recovery to the watchdog's next tick
                        events = None;
                    }
                },
                _ = watchdog.tick() => {
                    self.keep_alive(&mut session, &mut events).await;
                }
            }
        }

        self.shutdown_session(session).await;
    }

    /// Watchdog tick: probe the connection, and on failure make exactly one
    /// inline reconnect attempt. A failed reconnect leaves the watchdog
    /// armed for the next tick instead of terminating the supervisor.
    async fn keep_alive(
        &self,
        session: &mut Option<Box<dyn MailSession>>,
        events: &mut Option<flume::Receiver<MailboxEvent>>,
    ) {
        if let Some(live) = session.as_mut() {
            match live.noop().await {
                Ok(()) => {
                    debug!(account = %self.account.id, "keep-alive ok");
                    return;
                }
                Err(e) => {
                    warn!(account = %self.account.id, "watchdog keep-alive failed: {}", e);
                    self.set_reconnecting(e.to_string()).await;
                    *session = None;
                    *events = None;
                }
            }
        }

        match self.factory.connect(&self.account).await {
            Ok(mut fresh) => match self.start_watching(fresh.as_mut()).await {
                Ok(rx) => {
                    info!(account = %self.account.id, "reconnected");
                    *session = Some(fresh);
                    *events = Some(rx);
                }
                Err(e) => {
                    warn!(account = %self.account.id, "reconnect failed to reopen mailbox: {}", e);
                    self.set_reconnecting(e.to_string()).await;
                }
            },
            Err(e) => {
                warn!(account = %self.account.id, "reconnect failed: {}", e);
                self.set_reconnecting(e.to_string()).await;
            }
        }
    }

    /// Reopen the inbox writable, begin change monitoring and record the
    /// Watching transition (preserving host/user from the current record).
    async fn start_watching(
        &self,
        session: &mut dyn MailSession,
    ) -> Result<flume::Receiver<MailboxEvent>> {
        session.open_mailbox(INBOX, false).await?;
        let rx = session.subscribe().await?;

        let fallback = {
            let mut status = self.base_status(ConnectionState::Watching, true, None);
            status.mailbox = Some(INBOX.to_string());
            status
        };
        self.store
            .update(&self.account.id, move |current| match current {
                Some(mut status) => {
                    status.state = ConnectionState::Watching;
                    status.connected = true;
                    status.mailbox = Some(INBOX.to_string());
                    status.last_error = None;
                    status
                }
                None => fallback,
            })
            .await;

        Ok(rx)
    }

    async fn transition_backfilling(&self) {
        let fallback = self.base_status(ConnectionState::Backfilling, true, None);
        self.store
            .update(&self.account.id, move |current| match current {
                Some(mut status) => {
                    status.state = ConnectionState::Backfilling;
                    status
                }
                None => fallback,
            })
            .await;
    }

    async fn set_reconnecting(&self, error: String) {
        let fallback =
            self.base_status(ConnectionState::Reconnecting, false, Some(error.clone()));
        self.store
            .update(&self.account.id, move |current| match current {
                Some(mut status) => {
                    status.state = ConnectionState::Reconnecting;
                    status.connected = false;
                    status.last_error = Some(error);
                    status
                }
                None => fallback,
            })
            .await;
    }

    /// Orderly logout with a bounded wait; failures are logged, never
    /// propagated, so one slow account cannot block the others.
    async fn shutdown_session(&self, session: Option<Box<dyn MailSession>>) {
        if let Some(mut live) = session {
            match tokio::time::timeout(self.config.logout_grace, live.logout()).await {
                Ok(Ok(())) => info!(account = %self.account.id, "logged out"),
                Ok(Err(e)) => warn!(account = %self.account.id, "logout failed: {}", e),
                Err(_) => warn!(account = %self.account.id, "logout timed out"),
            }
        }

        let fallback = self.base_status(ConnectionState::Stopped, false, None);
        self.store
            .update(&self.account.id, move |current| match current {
                Some(mut status) => {
                    status.state = ConnectionState::Stopped;
                    status.connected = false;
                    status
                }
                None => fallback,
            })
            .await;
    }

    /// Wait out the backoff unless shutdown arrives first.
    async fn backoff_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            res = self.shutdown.changed() => res.is_err() || *self.shutdown.borrow(),
        }
    }

    fn base_status(
        &self,
        state: ConnectionState,
        connected: bool,
        last_error: Option<String>,
    ) -> AccountStatus {
        AccountStatus {
            account_id: self.account.id.clone(),
            state,
            connected,
            host: self.account.host.clone(),
            user: mask_user(&self.account.username),
            mailbox: None,
            last_error,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::dispatch::testing::recording_dispatcher;
    use crate::error::SyncError;
    use crate::session::testing::{test_account, MockSession, ScriptedFactory};
    use crate::session::RawMessage;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            watchdog_period: Duration::from_secs(60),
            ..SupervisorConfig::default()
        }
    }

    fn build(
        factory: Arc<ScriptedFactory>,
        config: SupervisorConfig,
    ) -> (
        ConnectionSupervisor,
        StatusStore,
        watch_channel::Sender<bool>,
        flume::Receiver<crate::normalize::MessageRecord>,
    ) {
        let store = StatusStore::new();
        let (dispatcher, upserts, _categories) = recording_dispatcher();
        let (shutdown_tx, shutdown_rx) = watch_channel::channel(false);
        let supervisor = ConnectionSupervisor::new(
            test_account("acc1"),
            config,
            factory,
            store.clone(),
            dispatcher,
            shutdown_rx,
        );
        (supervisor, store, shutdown_tx, upserts)
    }

    #[tokio::test(start_paused = true)]
    async fn first_try_connect_reaches_watching_with_masked_user() {
        let (session, handles) = MockSession::new();
        let factory = Arc::new(ScriptedFactory::new(vec![Ok(session)]));
        let (supervisor, store, shutdown_tx, _upserts) = build(factory.clone(), fast_config());

        let task = tokio::spawn(supervisor.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = store.get("acc1").await;
        assert!(status.connected);
        assert_eq!(status.state, ConnectionState::Watching);
        assert_eq!(status.host, "imap.example.com");
        assert_eq!(status.user, "so****om");
        assert_eq!(status.mailbox.as_deref(), Some("INBOX"));
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);

        // backfill opened the inbox read-only before the writable live watch
        assert_eq!(
            handles.opened.lock().unwrap().as_slice(),
            &[
                ("INBOX".to_string(), true),
                ("INBOX".to_string(), false)
            ]
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(store.get("acc1").await.state, ConnectionState::Stopped);
        assert_eq!(handles.logout_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_use_three_attempts_with_linear_backoff() {
        let factory = Arc::new(ScriptedFactory::new(vec![
            Err(SyncError::Connection("refused".into())),
            Err(SyncError::Connection("refused".into())),
            Err(SyncError::Connection("refused".into())),
        ]));
        let (supervisor, store, _shutdown_tx, _upserts) = build(factory.clone(), fast_config());

        let start = Instant::now();
        supervisor.run().await;

        // 2s after attempt 1, 4s after attempt 2, nothing after the last
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 3);

        let status = store.get("acc1").await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.connected);
        assert!(status.last_error.unwrap().contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_aborts_after_a_single_attempt() {
        let factory = Arc::new(ScriptedFactory::new(vec![Err(SyncError::Auth(
            "invalid credentials".into(),
        ))]));
        let (supervisor, store, _shutdown_tx, _upserts) = build(factory.clone(), fast_config());

        let start = Instant::now();
        supervisor.run().await;

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);

        let status = store.get("acc1").await;
        assert_eq!(status.state, ConnectionState::AuthFailed);
        assert!(!status.connected);
        assert!(status.last_error.unwrap().contains("invalid credentials"));
    }

    #[tokio::test(start_paused = true)]
    async fn mailbox_event_triggers_unseen_fetch() {
        let raw = concat!(
            "Message-ID: <live@x>\r\n",
            "Subject: Ping\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "body text\r\n",
        );

        let (mut session, handles) = MockSession::new();
        *session.unseen_uids.lock().unwrap() = vec![7];
        session.full_messages = vec![RawMessage {
            uid: 7,
            source: Some(raw.as_bytes().to_vec()),
        }];
        let factory = Arc::new(ScriptedFactory::new(vec![Ok(session)]));
        let (supervisor, store, shutdown_tx, upserts) = build(factory, fast_config());

        let task = tokio::spawn(supervisor.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("acc1").await.state, ConnectionState::Watching);

        handles
            .event_tx
            .send(MailboxEvent::Exists { count: 8 })
            .unwrap();
        let record = upserts.recv_async().await.unwrap();
        assert_eq!(record.id, "<live@x>");
        assert!(record.body.contains("body text"));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_recovers_connection_across_ticks() {
        let (mut first, first_handles) = MockSession::new();
        first.noop_error = Some(SyncError::Connection("broken pipe".into()));
        let (second, second_handles) = MockSession::new();
        let factory = Arc::new(ScriptedFactory::new(vec![
            Ok(first),
            Err(SyncError::Connection("still down".into())),
            Ok(second),
        ]));
        let (supervisor, store, shutdown_tx, _upserts) = build(factory.clone(), fast_config());

        let task = tokio::spawn(supervisor.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("acc1").await.state, ConnectionState::Watching);

        // first tick: NOOP fails, the single inline reconnect fails too
        tokio::time::sleep(Duration::from_secs(61)).await;
        let status = store.get("acc1").await;
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert!(!status.connected);
        assert!(status.last_error.unwrap().contains("still down"));
        assert_eq!(first_handles.noop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 2);

        // next tick: reconnect succeeds and watching resumes
        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = store.get("acc1").await;
        assert_eq!(status.state, ConnectionState::Watching);
        assert!(status.connected);
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(second_handles.logout_calls.load(Ordering::SeqCst), 1);
    }
}
