//! Mail session abstraction
//!
//! The supervisor drives one `MailSession` at a time and owns it mutably, so
//! at most one protocol operation is ever outstanding per connection. Live
//! mailbox changes arrive over a typed `flume` channel obtained from
//! `subscribe`, never via callbacks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::AccountConfig;
use crate::error::Result;

/// The mailbox every account synchronizes.
pub const INBOX: &str = "INBOX";

/// Envelope metadata fetched without the message body.
#[derive(Debug, Clone)]
pub struct RemoteEnvelope {
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
}

/// Full raw source of one message. `source` is absent when the server
/// returned no body for the UID; the watcher skips such messages.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub source: Option<Vec<u8>>,
}

/// Typed mailbox change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxEvent {
    /// The mailbox message count changed
    Exists { count: u32 },
    /// The event source lost its connection
    ConnectionLost,
}

/// One live connection to a mail server.
#[async_trait]
pub trait MailSession: Send {
    async fn open_mailbox(&mut self, folder: &str, read_only: bool) -> Result<()>;

    /// UIDs of messages received on or after the cutoff.
    async fn search_since(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<u32>>;

    /// UIDs of messages not yet marked seen.
    async fn search_unseen(&mut self) -> Result<Vec<u32>>;

    /// Envelope metadata only; unparsable entries are skipped, not errors.
    async fn fetch_metadata(&mut self, uids: &[u32]) -> Result<Vec<RemoteEnvelope>>;

    /// Full raw sources for the given UIDs.
    async fn fetch_full(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>>;

    /// Begin mailbox change monitoring and return the event channel.
    async fn subscribe(&mut self) -> Result<flume::Receiver<MailboxEvent>>;

    /// No-op keep-alive probe.
    async fn noop(&mut self) -> Result<()>;

    async fn logout(&mut self) -> Result<()>;
}

/// Creates sessions for one account; used for the initial connect and every
/// reconnect. Connect errors are classified `Auth` or `Connection` here.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, account: &AccountConfig) -> Result<Box<dyn MailSession>>;
}
