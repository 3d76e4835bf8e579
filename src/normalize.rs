//! Message normalization
//!
//! Pure transformation from raw protocol data into the canonical
//! `MessageRecord`. Every function here is total: malformed input degrades
//! to empty strings, synthetic ids or the current time, never an error.

use chrono::{DateTime, Utc};
use mailparse::MailAddr;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::parser::ParsedMessage;
use crate::session::RemoteEnvelope;

/// Category assigned before classification has run.
pub const DEFAULT_CATEGORY: &str = "Uncategorized";

/// Canonical message record handed to the downstream indexer. Transient:
/// constructed, dispatched, then discarded by this engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message-ID header when present, else a synthetic uid-based id.
    /// Stable across re-fetches, so downstream overwrite is idempotent.
    pub id: String,
    pub account_id: String,
    pub folder: String,
    pub subject: String,
    /// Plaintext when available, raw markup as fallback; empty for
    /// metadata-only backfill records
    pub body: String,
    pub from: String,
    pub to: Vec<String>,
    pub date: DateTime<Utc>,
    pub category: String,
    pub indexed_at: DateTime<Utc>,
    /// Opaque protocol metadata
    pub meta: serde_json::Value,
}

/// Derive the stable id: trimmed Message-ID header, else `uid-<uid>`.
pub fn stable_id(message_id: Option<&str>, uid: u32) -> String {
    match message_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => format!("uid-{}", uid),
    }
}

/// Build a metadata-only record from an envelope (backfill path).
pub fn from_envelope(account_id: &str, folder: &str, env: &RemoteEnvelope) -> MessageRecord {
    MessageRecord {
        id: stable_id(env.message_id.as_deref(), env.uid),
        account_id: account_id.to_string(),
        folder: folder.to_string(),
        subject: env.subject.clone().unwrap_or_default(),
        body: String::new(),
        from: env.from.join(", "),
        to: env.to.clone(),
        date: env.internal_date.unwrap_or_else(Utc::now),
        category: DEFAULT_CATEGORY.to_string(),
        indexed_at: Utc::now(),
        meta: json!({ "uid": env.uid, "source": "backfill" }),
    }
}

/// Build a full record from parsed fields (live-watch path).
pub fn from_parsed(
    account_id: &str,
    folder: &str,
    uid: u32,
    parsed: &ParsedMessage,
) -> MessageRecord {
    let body = parsed
        .text
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| parsed.html.clone())
        .unwrap_or_default();

    MessageRecord {
        id: stable_id(parsed.message_id.as_deref(), uid),
        account_id: account_id.to_string(),
        folder: folder.to_string(),
        subject: parsed.subject.clone().unwrap_or_default(),
        body,
        from: parsed.from.clone().unwrap_or_default(),
        to: parsed
            .to
            .as_deref()
            .map(flatten_address_list)
            .unwrap_or_default(),
        date: parsed.date.unwrap_or_else(Utc::now),
        category: DEFAULT_CATEGORY.to_string(),
        indexed_at: Utc::now(),
        meta: json!({ "uid": uid, "source": "live" }),
    }
}

/// Flatten a raw address-list header into a flat ordered address sequence.
/// Group syntax (`Team: a@x, b@y;`) is expanded to its members; input that
/// `mailparse` rejects falls back to a comma split.
pub fn flatten_address_list(raw: &str) -> Vec<String> {
    match mailparse::addrparse(raw) {
        Ok(list) => {
            let mut out = Vec::new();
            for addr in list.iter() {
                match addr {
                    MailAddr::Single(single) => out.extend(clean_address(&single.addr)),
                    MailAddr::Group(group) => {
                        out.extend(group.addrs.iter().filter_map(|a| clean_address(&a.addr)));
                    }
                }
            }
            out
        }
        Err(_) => raw
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
    }
}

/// `addrparse` keeps list-separator residue on addresses that follow a
/// group terminator; strip it so only the bare address survives.
fn clean_address(addr: &str) -> Option<String> {
    let cleaned = addr.trim_matches(|c: char| c == ',' || c == ';' || c.is_whitespace());
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::session::testing::envelope;

    #[test]
    fn stable_id_prefers_message_id() {
        assert_eq!(stable_id(Some(" <m1@x> "), 7), "<m1@x>");
        assert_eq!(stable_id(Some(""), 7), "uid-7");
        assert_eq!(stable_id(Some("   "), 7), "uid-7");
        assert_eq!(stable_id(None, 7), "uid-7");
    }

    #[test]
    fn backfill_records_are_metadata_only() {
        let env = envelope(42, Some("<m42@x>"), "Quarterly report");
        let record = from_envelope("acc1", "INBOX", &env);
        assert_eq!(record.id, "<m42@x>");
        assert_eq!(record.account_id, "acc1");
        assert_eq!(record.subject, "Quarterly report");
        assert_eq!(record.body, "");
        assert_eq!(record.category, DEFAULT_CATEGORY);
        assert_eq!(record.meta["uid"], 42);
    }

    #[test]
    fn envelope_without_message_id_gets_synthetic_id() {
        let env = envelope(9, None, "No id");
        let record = from_envelope("acc1", "INBOX", &env);
        assert_eq!(record.id, "uid-9");
    }

    #[test]
    fn parsed_record_prefers_plaintext_body() {
        let parsed = parser::ParsedMessage {
            message_id: Some("<m@x>".into()),
            subject: Some("Hi".into()),
            from: Some("Jane <jane@example.com>".into()),
            to: Some("a@x.com, b@y.com".into()),
            date: None,
            text: Some("plain".into()),
            html: Some("<p>html</p>".into()),
        };
        let record = from_parsed("acc1", "INBOX", 3, &parsed);
        assert_eq!(record.body, "plain");
        assert_eq!(record.to, vec!["a@x.com", "b@y.com"]);
    }

    #[test]
    fn parsed_record_falls_back_to_html_then_empty() {
        let mut parsed = parser::ParsedMessage {
            html: Some("<p>html only</p>".into()),
            ..Default::default()
        };
        let record = from_parsed("acc1", "INBOX", 3, &parsed);
        assert_eq!(record.body, "<p>html only</p>");

        parsed.html = None;
        let record = from_parsed("acc1", "INBOX", 3, &parsed);
        assert_eq!(record.body, "");
        assert_eq!(record.subject, "");
        assert_eq!(record.id, "uid-3");
    }

    #[test]
    fn invalid_date_coerces_to_now() {
        let parsed = parser::ParsedMessage::default();
        let before = Utc::now();
        let record = from_parsed("acc1", "INBOX", 1, &parsed);
        assert!(record.date >= before);
    }

    #[test]
    fn address_groups_flatten_in_order() {
        let flat = flatten_address_list("Team: a@x.com, b@y.com;, solo@z.com");
        assert_eq!(flat, vec!["a@x.com", "b@y.com", "solo@z.com"]);
    }

    #[test]
    fn separator_residue_is_stripped_from_addresses() {
        assert_eq!(clean_address(", solo@z.com"), Some("solo@z.com".into()));
        assert_eq!(clean_address("a@x.com;"), Some("a@x.com".into()));
        assert_eq!(clean_address(" , ; "), None);
    }

    #[test]
    fn unparsable_address_list_falls_back_to_comma_split() {
        let flat = flatten_address_list("<<<not valid, also@ok.com");
        assert_eq!(flat, vec!["<<<not valid", "also@ok.com"]);
    }
}
