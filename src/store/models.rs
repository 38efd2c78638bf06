//! Stored record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::email::InboundEmail;

/// Processing status of a stored email.
///
/// Transitions form a DAG: `pending → processing → (completed | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True for `completed` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A stored email record.
#[derive(Debug, Clone)]
pub struct StoredEmail {
    pub id: i64,
    pub message_id: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub cc_addrs: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    pub raw_message: Vec<u8>,
    /// Captured headers as a JSON object, when any were present.
    pub headers: Option<String>,
    /// Attachment metadata as a JSON array, when any were present.
    pub attachments: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub mailbox_name: Option<String>,
    pub status: EmailStatus,
}

impl StoredEmail {
    /// Build a pending record from a parsed inbound email.
    pub fn from_inbound(inbound: &InboundEmail) -> Self {
        let headers = if inbound.headers.is_empty() {
            None
        } else {
            serde_json::to_string(&inbound.headers).ok()
        };
        let attachments = if inbound.attachments.is_empty() {
            None
        } else {
            let infos: Vec<crate::email::AttachmentInfo> = inbound
                .attachments
                .iter()
                .map(|a| crate::email::AttachmentInfo {
                    filename: a.filename.clone(),
                    content_type: a.content_type.clone(),
                    size: a.size,
                })
                .collect();
            serde_json::to_string(&infos).ok()
        };

        Self {
            id: 0,
            message_id: inbound.message_id.clone(),
            from_addr: inbound.from.address.clone(),
            to_addrs: inbound.to_addresses(),
            cc_addrs: inbound.cc_addresses(),
            subject: inbound.subject.clone(),
            text_body: inbound.text_body.clone(),
            html_body: inbound.html_body.clone(),
            raw_message: inbound.raw_message.clone(),
            headers,
            attachments,
            received_at: inbound.received_at,
            processed_at: None,
            mailbox_name: None,
            status: EmailStatus::Pending,
        }
    }
}

/// A log entry for one processing step of an email.
#[derive(Debug, Clone, Default)]
pub struct ProcessingLog {
    pub id: i64,
    pub email_id: i64,
    pub step: String,
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// A record of one tool invocation made while processing an email.
#[derive(Debug, Clone, Default)]
pub struct ToolCallRecord {
    pub id: i64,
    pub email_id: i64,
    pub tool_name: String,
    pub arguments: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub called_at: DateTime<Utc>,
}

/// A stored attachment row, bytes included.
#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub id: i64,
    pub email_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub content_id: Option<String>,
    pub data: Vec<u8>,
}

/// Filter options for listing emails.
#[derive(Debug, Clone, Default)]
pub struct EmailFilter {
    pub status: Option<EmailStatus>,
    pub mailbox_name: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

/// Email processing statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmailStats {
    pub total_emails: i64,
    pub pending_emails: i64,
    pub processed_emails: i64,
    pub failed_emails: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::{Address, Attachment};

    #[test]
    fn status_round_trip() {
        for status in [
            EmailStatus::Pending,
            EmailStatus::Processing,
            EmailStatus::Completed,
            EmailStatus::Failed,
        ] {
            assert_eq!(EmailStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EmailStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!EmailStatus::Pending.is_terminal());
        assert!(!EmailStatus::Processing.is_terminal());
        assert!(EmailStatus::Completed.is_terminal());
        assert!(EmailStatus::Failed.is_terminal());
    }

    #[test]
    fn from_inbound_serializes_attachment_metadata() {
        let inbound = InboundEmail {
            message_id: "<1.local>".into(),
            from: Address::new("a@b.com"),
            to: vec![Address::new("c@d.com")],
            attachments: vec![Attachment {
                filename: "f.txt".into(),
                content_type: "text/plain".into(),
                content_id: None,
                size: 3,
                data: b"abc".to_vec(),
            }],
            ..Default::default()
        };
        let stored = StoredEmail::from_inbound(&inbound);
        assert_eq!(stored.status, EmailStatus::Pending);
        assert_eq!(stored.from_addr, "a@b.com");
        let meta = stored.attachments.unwrap();
        assert!(meta.contains("f.txt"));
        // Bytes never land in the metadata JSON.
        assert!(!meta.contains("abc"));
    }
}
