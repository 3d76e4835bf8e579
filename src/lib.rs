//! Multi-account IMAP ingestion engine.
//!
//! Each configured account gets its own supervisor that connects with
//! bounded retries, backfills a recent history window, then watches the
//! inbox live. Normalized records flow through a shared dispatcher into an
//! Elasticsearch-compatible index and an LLM categorizer; per-account health
//! is observable at any time through the [`status::StatusStore`].

pub mod backfill;
pub mod categorizer;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod imap;
pub mod indexer;
pub mod normalize;
pub mod parser;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod watch;

pub use config::Settings;
pub use coordinator::SyncCoordinator;
pub use error::{Result, SyncError};
pub use normalize::MessageRecord;
pub use status::{AccountStatus, ConnectionState, StatusStore};
