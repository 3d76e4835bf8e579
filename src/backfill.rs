//! Historical backfill
//!
//! One-shot sync of a bounded recent window, run exactly once per successful
//! connect. Only envelope metadata is fetched; every emitted record carries
//! an empty body to bound memory and network cost during history replay.

use chrono::Utc;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::normalize;
use crate::session::{MailSession, INBOX};

pub struct BackfillScanner {
    /// Cutoff window: messages on or after now minus this many days
    pub window_days: i64,
}

impl Default for BackfillScanner {
    fn default() -> Self {
        Self { window_days: 30 }
    }
}

impl BackfillScanner {
    /// Scan the inbox read-only and dispatch one metadata-only record per
    /// historical message. Returns the number of records emitted.
    pub async fn run(
        &self,
        account_id: &str,
        session: &mut dyn MailSession,
        dispatcher: &Dispatcher,
    ) -> Result<u32> {
        session.open_mailbox(INBOX, true).await?;

        let cutoff = Utc::now() - chrono::Duration::days(self.window_days);
        let uids = session.search_since(cutoff).await?;
        info!(
            account = %account_id,
            count = uids.len(),
            cutoff = %cutoff.to_rfc3339(),
            "backfill found historical messages"
        );

        if uids.is_empty() {
            return Ok(0);
        }

        // Metadata only: per-message parse failures were already skipped by
        // the session, so everything returned here is dispatchable.
        let envelopes = session.fetch_metadata(&uids).await?;
        let mut emitted = 0u32;
        for env in &envelopes {
            let record = normalize::from_envelope(account_id, INBOX, env);
            debug!(account = %account_id, id = %record.id, "backfill record");
            dispatcher.dispatch(record).await;
            emitted += 1;
        }

        info!(account = %account_id, emitted, "backfill complete");
        Ok(emitted)
    }
}
