//! Inbound and outbound email models.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An email address with an optional display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if !name.is_empty() => write!(f, "{} <{}>", name, self.address),
            _ => write!(f, "{}", self.address),
        }
    }
}

/// An email attachment. `data` carries the decoded bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    pub size: i64,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// A parsed inbound email.
#[derive(Debug, Clone, Default)]
pub struct InboundEmail {
    pub message_id: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Option<Address>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub text_body: String,
    pub html_body: String,
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<Attachment>,
    pub raw_message: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundEmail {
    /// Bare recipient addresses from `To`.
    pub fn to_addresses(&self) -> Vec<String> {
        self.to.iter().map(|a| a.address.clone()).collect()
    }

    /// Bare recipient addresses from `Cc`.
    pub fn cc_addresses(&self) -> Vec<String> {
        self.cc.iter().map(|a| a.address.clone()).collect()
    }

    /// The best available body, text preferred.
    pub fn body(&self) -> &str {
        if !self.text_body.is_empty() {
            &self.text_body
        } else {
            &self.html_body
        }
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Build the view of this email handed to the LLM.
    pub fn context(&self) -> EmailContext {
        EmailContext {
            from: self.from.to_string(),
            to: self.to_addresses(),
            cc: self.cc_addresses(),
            subject: self.subject.clone(),
            body: self.body().to_string(),
            date: self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string(),
            has_html: !self.html_body.is_empty(),
            attachments: self
                .attachments
                .iter()
                .map(|a| AttachmentInfo {
                    filename: a.filename.clone(),
                    content_type: a.content_type.clone(),
                    size: a.size,
                })
                .collect(),
            headers: self.headers.clone(),
        }
    }
}

/// An email to be sent through an `EmailSender`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboundEmail {
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Address>,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

/// The email view rendered into the LLM user message.
#[derive(Debug, Clone, Serialize)]
pub struct EmailContext {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub date: String,
    pub has_html: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentInfo>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Attachment metadata without the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub filename: String,
    pub content_type: String,
    pub size: i64,
}
