//! Raw message parsing
//!
//! Thin wrapper over `mailparse`: raw RFC 822 bytes in, structured header
//! fields and the first text/plain and text/html bodies out. Header values
//! are RFC 2047 decoded by `mailparse` itself.

use chrono::{DateTime, Utc};
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};

use crate::error::{Result, SyncError};

/// Structured fields of one parsed message.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    /// Raw From header value, e.g. `"Jane Doe" <jane@example.com>`
    pub from: Option<String>,
    /// Raw To header value; may contain address-list groups
    pub to: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub html: Option<String>,
}

/// Parse a raw message source into structured fields.
pub fn parse(raw: &[u8]) -> Result<ParsedMessage> {
    let mail = parse_mail(raw).map_err(|e| SyncError::Parse(e.to_string()))?;

    let headers = &mail.headers;
    let date = headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    let mut text = None;
    let mut html = None;
    collect_bodies(&mail, &mut text, &mut html);

    Ok(ParsedMessage {
        message_id: headers.get_first_value("Message-ID"),
        subject: headers.get_first_value("Subject"),
        from: headers.get_first_value("From"),
        to: headers.get_first_value("To"),
        date,
        text,
        html,
    })
}

/// Walk the MIME tree keeping the first text/plain and text/html bodies.
fn collect_bodies(part: &ParsedMail, text: &mut Option<String>, html: &mut Option<String>) {
    if part.subparts.is_empty() {
        let mimetype = part.ctype.mimetype.to_lowercase();
        match mimetype.as_str() {
            "text/plain" if text.is_none() => {
                if let Ok(body) = part.get_body() {
                    *text = Some(body);
                }
            }
            "text/html" if html.is_none() => {
                if let Ok(body) = part.get_body() {
                    *html = Some(body);
                }
            }
            _ => {}
        }
        return;
    }

    for sub in &part.subparts {
        collect_bodies(sub, text, html);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_plaintext_message() {
        let raw = concat!(
            "Message-ID: <abc@example.com>\r\n",
            "Subject: Hello\r\n",
            "From: Jane Doe <jane@example.com>\r\n",
            "To: someone@example.com\r\n",
            "Date: Mon, 25 Aug 2025 10:00:00 +0000\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Hi there, just checking in.\r\n",
        );

        let parsed = parse(raw.as_bytes()).unwrap();
        assert_eq!(parsed.message_id.as_deref(), Some("<abc@example.com>"));
        assert_eq!(parsed.subject.as_deref(), Some("Hello"));
        assert_eq!(parsed.from.as_deref(), Some("Jane Doe <jane@example.com>"));
        assert!(parsed.text.unwrap().contains("checking in"));
        assert!(parsed.html.is_none());
        assert!(parsed.date.is_some());
    }

    #[test]
    fn picks_both_bodies_from_multipart_alternative() {
        let raw = concat!(
            "Subject: Multi\r\n",
            "Content-Type: multipart/alternative; boundary=\"sep\"\r\n",
            "\r\n",
            "--sep\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain body\r\n",
            "--sep\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>html body</p>\r\n",
            "--sep--\r\n",
        );

        let parsed = parse(raw.as_bytes()).unwrap();
        assert!(parsed.text.unwrap().contains("plain body"));
        assert!(parsed.html.unwrap().contains("html body"));
    }

    #[test]
    fn missing_headers_yield_none_not_errors() {
        let parsed = parse(b"\r\nbare body\r\n").unwrap();
        assert!(parsed.subject.is_none());
        assert!(parsed.message_id.is_none());
        assert!(parsed.date.is_none());
    }
}
