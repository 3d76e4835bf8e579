//! Per-account connection health registry
//!
//! The store is an explicitly constructed instance passed to every
//! supervisor; it is safe under one writer per account plus any number of
//! concurrent readers (the external status API). Credentials are masked
//! before they ever enter a record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Connection lifecycle of one account. Exactly one live state at any time;
/// state changes are the only way the status store is mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    AuthFailed,
    Backfilling,
    Watching,
    Reconnecting,
    Stopped,
}

/// Health record for one account, written only by its supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatus {
    pub account_id: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub host: String,
    /// Masked username, never the raw credential
    pub user: String,
    pub mailbox: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AccountStatus {
    /// Documented default returned for unknown account ids.
    pub fn disconnected(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            state: ConnectionState::Disconnected,
            connected: false,
            host: String::new(),
            user: String::new(),
            mailbox: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// A status write: either a full replacement or a transform of the current
/// record, for transitions that need to preserve fields.
pub enum StatusUpdate {
    Set(AccountStatus),
    Update(Box<dyn FnOnce(Option<AccountStatus>) -> AccountStatus + Send>),
}

/// Concurrency-safe registry of per-account health.
#[derive(Clone, Default)]
pub struct StatusStore {
    inner: Arc<RwLock<HashMap<String, AccountStatus>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, account_id: &str, update: StatusUpdate) {
        let mut map = self.inner.write().await;
        let mut next = match update {
            StatusUpdate::Set(record) => record,
            StatusUpdate::Update(f) => f(map.get(account_id).cloned()),
        };
        next.updated_at = Utc::now();
        map.insert(account_id.to_string(), next);
    }

    pub async fn set(&self, account_id: &str, record: AccountStatus) {
        self.apply(account_id, StatusUpdate::Set(record)).await;
    }

    pub async fn update<F>(&self, account_id: &str, f: F)
    where
        F: FnOnce(Option<AccountStatus>) -> AccountStatus + Send + 'static,
    {
        self.apply(account_id, StatusUpdate::Update(Box::new(f)))
            .await;
    }

    /// Never fails: unknown ids read as disconnected.
    pub async fn get(&self, account_id: &str) -> AccountStatus {
        let map = self.inner.read().await;
        map.get(account_id)
            .cloned()
            .unwrap_or_else(|| AccountStatus::disconnected(account_id))
    }

    /// Snapshot of every tracked account, for the status API.
    pub async fn all(&self) -> HashMap<String, AccountStatus> {
        self.inner.read().await.clone()
    }
}

/// Partially mask a username before it enters a status record.
pub fn mask_user(user: &str) -> String {
    if user.is_empty() {
        return String::new();
    }
    if user.chars().count() <= 4 {
        return "****".to_string();
    }
    let chars: Vec<char> = user.chars().collect();
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}****{}", head, tail)
}
