//! Outbound email delivery — the `EmailSender` capability and its providers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::info;

use crate::email::{Address, OutboundEmail};
use crate::error::ToolError;

/// The capability the core uses to emit outbound mail.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ToolError>;
}

/// Sends email through the Resend REST API.
pub struct ResendSender {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

const RESEND_BASE_URL: &str = "https://api.resend.com";

impl ResendSender {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("default reqwest client"),
            api_key: SecretString::from(api_key.into()),
            base_url: RESEND_BASE_URL.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ResendRequest {
    from: String,
    to: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc: Vec<String>,
    subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
}

#[async_trait]
impl EmailSender for ResendSender {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ToolError> {
        let mut headers = BTreeMap::new();
        if let Some(ref in_reply_to) = email.in_reply_to {
            headers.insert("In-Reply-To".to_string(), bracketed(in_reply_to));
            if !email.references.is_empty() {
                let refs: Vec<String> = email.references.iter().map(|r| bracketed(r)).collect();
                headers.insert("References".to_string(), refs.join(" "));
            }
        }

        let request = ResendRequest {
            from: email.from.to_string(),
            to: bare_addresses(&email.to),
            cc: bare_addresses(&email.cc),
            bcc: bare_addresses(&email.bcc),
            subject: email.subject.clone(),
            text: (!email.text_body.is_empty()).then(|| email.text_body.clone()),
            html: (!email.html_body.is_empty()).then(|| email.html_body.clone()),
            headers,
        };

        let response = self
            .http
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| ToolError::Execution(format!("resend: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Execution(format!("resend: {status}: {body}")));
        }

        info!(to = ?request.to, subject = %request.subject, "Email sent via Resend");
        Ok(())
    }
}

/// Sends email by direct SMTP submission with optional PLAIN auth.
pub struct SmtpSender {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl SmtpSender {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    fn build_message(email: &OutboundEmail) -> Result<Message, ToolError> {
        let mut builder = Message::builder()
            .from(mailbox(&email.from)?)
            .subject(email.subject.clone());

        for to in &email.to {
            builder = builder.to(mailbox(to)?);
        }
        for cc in &email.cc {
            builder = builder.cc(mailbox(cc)?);
        }
        for bcc in &email.bcc {
            builder = builder.bcc(mailbox(bcc)?);
        }
        if let Some(ref reply_to) = email.reply_to {
            builder = builder.reply_to(mailbox(reply_to)?);
        }
        if let Some(ref in_reply_to) = email.in_reply_to {
            builder = builder.in_reply_to(bracketed(in_reply_to));
        }

        let message = if email.html_body.is_empty() {
            builder.body(email.text_body.clone())
        } else {
            builder.multipart(MultiPart::alternative_plain_html(
                email.text_body.clone(),
                email.html_body.clone(),
            ))
        };
        message.map_err(|e| ToolError::Execution(format!("failed to build message: {e}")))
    }
}

#[async_trait]
impl EmailSender for SmtpSender {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ToolError> {
        let message = Self::build_message(email)?;
        let host = self.host.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();

        // lettre's SmtpTransport is blocking; keep it off the runtime threads.
        tokio::task::spawn_blocking(move || {
            let transport = if username.is_empty() {
                SmtpTransport::builder_dangerous(&host).port(port).build()
            } else {
                SmtpTransport::relay(&host)
                    .map_err(|e| ToolError::Execution(format!("smtp relay: {e}")))?
                    .port(port)
                    .credentials(Credentials::new(username, password))
                    .build()
            };
            transport
                .send(&message)
                .map_err(|e| ToolError::Execution(format!("smtp send: {e}")))?;
            Ok::<(), ToolError>(())
        })
        .await
        .map_err(|e| ToolError::Execution(format!("smtp task failed: {e}")))??;

        info!(host = %self.host, "Email sent via SMTP submission");
        Ok(())
    }
}

/// Sender that drops everything. Used when no outbound provider is
/// configured, and in tests.
pub struct NoopSender;

#[async_trait]
impl EmailSender for NoopSender {
    async fn send(&self, _email: &OutboundEmail) -> Result<(), ToolError> {
        Ok(())
    }
}

fn bare_addresses(addrs: &[Address]) -> Vec<String> {
    addrs.iter().map(|a| a.address.clone()).collect()
}

fn mailbox(addr: &Address) -> Result<Mailbox, ToolError> {
    let parsed = addr
        .address
        .parse::<lettre::Address>()
        .map_err(|e| ToolError::InvalidArguments(format!("invalid address {}: {e}", addr.address)))?;
    Ok(Mailbox::new(addr.name.clone(), parsed))
}

fn bracketed(id: &str) -> String {
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}
