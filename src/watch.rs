//! Live new-mail processing
//!
//! Runs after backfill, on each mailbox size-change event: search unseen,
//! fetch full sources, parse, normalize, dispatch. A single bad message is
//! skipped, never the batch.

use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::normalize;
use crate::parser;
use crate::session::{MailSession, INBOX};

/// Fetch and dispatch every unseen message. Returns how many records were
/// dispatched; zero when the notification turned out to be a no-op.
pub async fn process_new_mail(
    account_id: &str,
    session: &mut dyn MailSession,
    dispatcher: &Dispatcher,
) -> Result<u32> {
    let unseen = session.search_unseen().await?;
    if unseen.is_empty() {
        debug!(account = %account_id, "no unseen messages");
        return Ok(0);
    }

    debug!(account = %account_id, count = unseen.len(), "fetching unseen messages");
    let messages = session.fetch_full(&unseen).await?;

    let mut dispatched = 0u32;
    for msg in messages {
        let Some(source) = msg.source else {
            warn!(account = %account_id, uid = msg.uid, "message source missing, skipping");
            continue;
        };

        let parsed = match parser::parse(&source) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(account = %account_id, uid = msg.uid, "failed to parse message: {}", e);
                continue;
            }
        };

        let record = normalize::from_parsed(account_id, INBOX, msg.uid, &parsed);
        debug!(account = %account_id, id = %record.id, subject = %record.subject, "new message");
        dispatcher.dispatch(record).await;
        dispatched += 1;
    }

    Ok(dispatched)
}
