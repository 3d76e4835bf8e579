//! IMAP adapter
//!
//! Production `MailSession` over async-imap with implicit TLS. Live change
//! detection runs on a dedicated sidecar connection that polls the mailbox
//! size, keeping the primary session free for fetches; the sidecar dies with
//! its channel and a fresh one is created on every (re)subscribe.

use std::time::Duration;

use async_imap::types::Fetch;
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::AccountConfig;
use crate::error::{Result, SyncError};
use crate::session::{
    MailSession, MailboxEvent, RawMessage, RemoteEnvelope, SessionFactory, INBOX,
};

// An IMAP session is generic over the stream type; ours is TLS-encrypted
// TCP, tokio I/O traits end to end.
type NativeSession = Session<TlsStream<TcpStream>>;

/// Connects real IMAP sessions; one instance is shared by every supervisor.
pub struct ImapSessionFactory {
    poll_interval: Duration,
}

impl ImapSessionFactory {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

#[async_trait]
impl SessionFactory for ImapSessionFactory {
    async fn connect(&self, account: &AccountConfig) -> Result<Box<dyn MailSession>> {
        let session = open_session(account).await?;
        Ok(Box::new(ImapMailSession {
            session,
            account: account.clone(),
            poll_interval: self.poll_interval,
        }))
    }
}

/// TCP connect, TLS handshake, LOGIN. TCP/TLS problems classify as
/// `Connection`; a rejected LOGIN classifies as `Auth` and is never retried
/// by the caller.
async fn open_session(account: &AccountConfig) -> Result<NativeSession> {
    info!(host = %account.host, port = account.port, "connecting to IMAP server");

    let tcp = TcpStream::connect((account.host.as_str(), account.port))
        .await
        .map_err(|e| SyncError::Connection(format!("TCP connection failed: {}", e)))?;

    let tls = async_native_tls::TlsConnector::new();
    let tls_stream = tls
        .connect(&account.host, tcp)
        .await
        .map_err(|e| SyncError::Connection(format!("TLS handshake failed: {}", e)))?;

    let client = async_imap::Client::new(tls_stream);
    let session = client
        .login(&account.username, &account.password)
        .await
        .map_err(|(e, _)| classify_login_error(e))?;

    Ok(session)
}

/// Only a NO response to LOGIN means the server rejected the credentials;
/// anything else during login is a transient connection problem and stays
/// retryable.
fn classify_login_error(err: async_imap::error::Error) -> SyncError {
    match err {
        async_imap::error::Error::No(response) => {
            SyncError::Auth(format!("login rejected: {}", response))
        }
        other => SyncError::Connection(format!("login failed: {}", other)),
    }
}

struct ImapMailSession {
    session: NativeSession,
    account: AccountConfig,
    poll_interval: Duration,
}

#[async_trait]
impl MailSession for ImapMailSession {
    async fn open_mailbox(&mut self, folder: &str, read_only: bool) -> Result<()> {
        let mailbox = if read_only {
            self.session.examine(folder).await
        } else {
            self.session.select(folder).await
        }
        .map_err(|e| SyncError::Connection(format!("SELECT {} failed: {}", folder, e)))?;

        debug!(folder = %folder, exists = mailbox.exists, read_only, "mailbox opened");
        Ok(())
    }

    async fn search_since(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<u32>> {
        let query = format!("SINCE {}", imap_date(cutoff));
        let uid_set = self
            .session
            .uid_search(&query)
            .await
            .map_err(|e| SyncError::Fetch(format!("SEARCH failed: {}", e)))?;

        let mut uids: Vec<u32> = uid_set.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn search_unseen(&mut self) -> Result<Vec<u32>> {
        let uid_set = self
            .session
            .uid_search("UNSEEN")
            .await
            .map_err(|e| SyncError::Fetch(format!("SEARCH UNSEEN failed: {}", e)))?;

        let mut uids: Vec<u32> = uid_set.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_metadata(&mut self, uids: &[u32]) -> Result<Vec<RemoteEnvelope>> {
        let uid_list = join_uids(uids);
        let stream = self
            .session
            .uid_fetch(&uid_list, "(UID ENVELOPE INTERNALDATE)")
            .await
            .map_err(|e| SyncError::Fetch(format!("FETCH envelopes failed: {}", e)))?;

        let fetches = collect_tolerant(stream, "envelopes").await;
        Ok(fetches.iter().filter_map(parse_remote_envelope).collect())
    }

    async fn fetch_full(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>> {
        let uid_list = join_uids(uids);
        let stream = self
            .session
            .uid_fetch(&uid_list, "(UID BODY.PEEK[])")
            .await
            .map_err(|e| SyncError::Fetch(format!("FETCH bodies failed: {}", e)))?;

        let fetches = collect_tolerant(stream, "bodies").await;
        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                Some(RawMessage {
                    uid,
                    source: fetch.body().map(|body| body.to_vec()),
                })
            })
            .collect())
    }

    async fn subscribe(&mut self) -> Result<flume::Receiver<MailboxEvent>> {
        Ok(spawn_mailbox_poller(
            self.account.clone(),
            self.poll_interval,
        ))
    }

    async fn noop(&mut self) -> Result<()> {
        self.session
            .noop()
            .await
            .map_err(|e| SyncError::Connection(format!("NOOP failed: {}", e)))
    }

    async fn logout(&mut self) -> Result<()> {
        self.session
            .logout()
            .await
            .map_err(|e| SyncError::Connection(format!("LOGOUT failed: {}", e)))
    }
}

/// Sidecar poller: its own connection, EXAMINE at each tick, emit an event
/// whenever the message count moves. The first observation only sets the
/// baseline since backfill already covers anything present at connect time.
fn spawn_mailbox_poller(
    account: AccountConfig,
    interval: Duration,
) -> flume::Receiver<MailboxEvent> {
    let (tx, rx) = flume::unbounded();

    tokio::spawn(async move {
        let mut session = match open_session(&account).await {
            Ok(session) => session,
            Err(e) => {
                warn!(account = %account.id, "mailbox poller failed to connect: {}", e);
                tx.send(MailboxEvent::ConnectionLost).ok();
                return;
            }
        };

        let mut last_exists: Option<u32> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if tx.is_disconnected() {
                debug!(account = %account.id, "mailbox poller unsubscribed");
                break;
            }

            match session.examine(INBOX).await {
                Ok(mailbox) => {
                    let count = mailbox.exists;
                    if let Some(prev) = last_exists {
                        if prev != count {
                            debug!(account = %account.id, prev, count, "mailbox size changed");
                            if tx.send(MailboxEvent::Exists { count }).is_err() {
                                break;
                            }
                        }
                    }
                    last_exists = Some(count);
                }
                Err(e) => {
                    warn!(account = %account.id, "mailbox poll failed: {}", e);
                    tx.send(MailboxEvent::ConnectionLost).ok();
                    break;
                }
            }
        }

        let _ = session.logout().await;
    });

    rx
}

/// Collects a FETCH stream tolerantly, logging and skipping individual
/// responses that fail to parse.
async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl futures::Stream<Item = std::result::Result<Fetch, E>>,
    context: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => warn!("skipping unparseable IMAP response ({}): {}", context, e),
        }
    }
    items
}

fn parse_remote_envelope(fetch: &Fetch) -> Option<RemoteEnvelope> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope()?;

    let message_id = envelope
        .message_id
        .as_ref()
        .map(|id| String::from_utf8_lossy(id).trim().to_string())
        .filter(|id| !id.is_empty());

    let subject = envelope
        .subject
        .as_ref()
        .map(|s| decode_rfc2047(&String::from_utf8_lossy(s)));

    Some(RemoteEnvelope {
        uid,
        message_id,
        subject,
        from: extract_addresses(&envelope.from),
        to: extract_addresses(&envelope.to),
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
    })
}

fn extract_addresses(addrs: &Option<Vec<async_imap::imap_proto::Address<'_>>>) -> Vec<String> {
    addrs
        .as_ref()
        .map(|list| {
            list.iter()
                .map(|addr| {
                    let mailbox = addr
                        .mailbox
                        .as_ref()
                        .map(|m| String::from_utf8_lossy(m).to_string())
                        .unwrap_or_default();
                    let host = addr
                        .host
                        .as_ref()
                        .map(|h| String::from_utf8_lossy(h).to_string())
                        .unwrap_or_default();
                    format!("{}@{}", mailbox, host)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Decode RFC 2047 encoded words by round-tripping through a fake header.
fn decode_rfc2047(input: &str) -> String {
    let fake_header = format!("X: {}", input);
    match mailparse::parse_header(fake_header.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => input.to_string(),
    }
}

/// IMAP date-text, e.g. `08-Feb-2025`.
fn imap_date(date: DateTime<Utc>) -> String {
    date.format("%d-%b-%Y").to_string()
}

fn join_uids(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn imap_date_uses_search_date_text() {
        let date = Utc.with_ymd_and_hms(2025, 2, 8, 13, 30, 0).unwrap();
        assert_eq!(imap_date(date), "08-Feb-2025");
    }

    #[test]
    fn uid_lists_are_comma_joined() {
        assert_eq!(join_uids(&[3, 7, 12]), "3,7,12");
        assert_eq!(join_uids(&[]), "");
    }

    #[test]
    fn only_no_responses_classify_as_auth() {
        let rejected =
            classify_login_error(async_imap::error::Error::No("LOGIN failed".into()));
        assert!(rejected.is_auth());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let dropped = classify_login_error(async_imap::error::Error::Io(io));
        assert!(!dropped.is_auth());
        assert!(matches!(dropped, SyncError::Connection(_)));

        let lost = classify_login_error(async_imap::error::Error::ConnectionLost);
        assert!(!lost.is_auth());
    }

    #[test]
    fn encoded_subjects_decode() {
        assert_eq!(
            decode_rfc2047("=?UTF-8?B?SGVsbG8gV29ybGQ=?="),
            "Hello World"
        );
        assert_eq!(decode_rfc2047("plain subject"), "plain subject");
    }
}
