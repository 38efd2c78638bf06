//! MIME parsing — raw RFC 5322 bytes into an `InboundEmail`.

use chrono::{DateTime, Utc};
use mail_parser::{Addr, HeaderValue, MessageParser, MimeHeaders};

use crate::email::model::{Address, Attachment, InboundEmail};
use crate::error::ParseError;

/// Headers captured verbatim onto the email's header map.
const CAPTURED_HEADERS: &[&str] = &[
    "X-Priority",
    "X-Mailer",
    "X-Spam-Status",
    "X-Spam-Score",
    "List-Unsubscribe",
    "List-Id",
    "Precedence",
    "Auto-Submitted",
];

/// Parses raw email messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a raw message into an `InboundEmail`.
    ///
    /// The returned email owns a copy of `raw`, so the caller's buffer may be
    /// reused.
    pub fn parse(&self, raw: &[u8]) -> Result<InboundEmail, ParseError> {
        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ParseError::Malformed("not a valid RFC 5322 message".into()))?;

        let now = Utc::now();
        let mut email = InboundEmail {
            raw_message: raw.to_vec(),
            received_at: now,
            ..Default::default()
        };

        // mail-parser strips the angle brackets; restore them so stored ids
        // carry one canonical form whether taken from the header or
        // synthesized.
        email.message_id = message
            .message_id()
            .map(|id| format!("<{id}>"))
            .unwrap_or_else(synthesize_message_id);

        if let Some(addr) = message.from().and_then(|a| a.first()) {
            if let Some(parsed) = convert_addr(addr) {
                email.from = parsed;
            }
        }
        email.to = convert_list(message.to());
        email.cc = convert_list(message.cc());
        email.bcc = convert_list(message.bcc());
        email.reply_to = message
            .reply_to()
            .and_then(|a| a.first())
            .and_then(convert_addr);

        // mail-parser decodes RFC 2047 encoded-words for us.
        email.subject = message.subject().unwrap_or_default().to_string();

        email.date = message
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or(now);

        for name in CAPTURED_HEADERS {
            if let Some(value) = message.header(*name).and_then(header_text) {
                if !value.is_empty() {
                    email.headers.insert((*name).to_string(), value);
                }
            }
        }

        // First text/plain part wins for the text body, first text/html for
        // the HTML body. Parts beyond the first are ignored for bodies.
        if !message.text_body.is_empty() {
            email.text_body = message
                .body_text(0)
                .map(|b| b.into_owned())
                .unwrap_or_default();
        }
        if !message.html_body.is_empty() {
            email.html_body = message
                .body_html(0)
                .map(|b| b.into_owned())
                .unwrap_or_default();
        }

        for part in message.attachments() {
            let data = part.contents().to_vec();
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            email.attachments.push(Attachment {
                filename: part.attachment_name().unwrap_or_default().to_string(),
                content_type,
                content_id: part
                    .content_id()
                    .map(|id| id.trim_matches(['<', '>']).to_string()),
                size: data.len() as i64,
                data,
            });
        }

        Ok(email)
    }
}

/// Generate a unique message id for emails that arrive without one.
fn synthesize_message_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("<{nanos}.local>")
}

fn convert_addr(addr: &Addr<'_>) -> Option<Address> {
    let address = addr.address()?.to_string();
    Some(Address {
        name: addr
            .name()
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        address,
    })
}

fn convert_list(header: Option<&mail_parser::Address<'_>>) -> Vec<Address> {
    match header {
        Some(list) => list.iter().filter_map(convert_addr).collect(),
        None => Vec::new(),
    }
}

fn header_text(value: &HeaderValue<'_>) -> Option<String> {
    match value {
        HeaderValue::Text(text) => Some(text.to_string()),
        HeaderValue::TextList(list) => Some(list.join(", ")),
        _ => None,
    }
}
