//! Outbound email tool — reply, forward, and send actions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::email::{Address, InboundEmail, OutboundEmail};
use crate::error::ToolError;
use crate::tools::sender::EmailSender;
use crate::tools::tool::{Tool, ToolContext};

/// Handles email operations. The currently-processing email arrives through
/// the [`ToolContext`], which keeps parallel dispatches isolated.
pub struct EmailTool {
    sender: Arc<dyn EmailSender>,
    from_address: String,
    from_name: String,
}

impl EmailTool {
    pub fn new(
        sender: Arc<dyn EmailSender>,
        from_address: impl Into<String>,
        from_name: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            from_address: from_address.into(),
            from_name: from_name.into(),
        }
    }

    fn from_addr(&self) -> Address {
        Address {
            name: (!self.from_name.is_empty()).then(|| self.from_name.clone()),
            address: self.from_address.clone(),
        }
    }

    async fn reply(&self, current: &InboundEmail, params: EmailArgs) -> Result<Value, ToolError> {
        let to = current
            .reply_to
            .clone()
            .unwrap_or_else(|| current.from.clone());

        let subject = if params.subject.is_empty() {
            prefixed_subject("Re:", &current.subject)
        } else {
            params.subject
        };

        let mut body = params.body;
        if params.include_original == Some(true) {
            body = append_original(body, current);
        }

        let outbound = OutboundEmail {
            from: self.from_addr(),
            to: vec![to.clone()],
            subject: subject.clone(),
            text_body: body,
            html_body: params.html_body,
            in_reply_to: Some(current.message_id.clone()),
            ..Default::default()
        };
        self.sender
            .send(&outbound)
            .await
            .map_err(|e| ToolError::Execution(format!("failed to send reply: {e}")))?;

        Ok(sent_result(vec![to.address], subject, "Reply sent successfully"))
    }

    async fn forward(&self, current: &InboundEmail, params: EmailArgs) -> Result<Value, ToolError> {
        if params.to.is_empty() {
            return Err(ToolError::InvalidArguments(
                "recipients required for forward".into(),
            ));
        }

        let subject = if params.subject.is_empty() {
            prefixed_subject("Fwd:", &current.subject)
        } else {
            params.subject
        };

        // Forwards include the original by default.
        let mut body = params.body;
        if params.include_original.unwrap_or(true) {
            body = append_original(body, current);
        }

        let outbound = OutboundEmail {
            from: self.from_addr(),
            to: params.to.iter().map(Address::new).collect(),
            cc: params.cc.iter().map(Address::new).collect(),
            subject: subject.clone(),
            text_body: body,
            html_body: params.html_body,
            ..Default::default()
        };
        self.sender
            .send(&outbound)
            .await
            .map_err(|e| ToolError::Execution(format!("failed to forward email: {e}")))?;

        Ok(sent_result(params.to, subject, "Email forwarded successfully"))
    }

    async fn send_new(&self, params: EmailArgs) -> Result<Value, ToolError> {
        if params.to.is_empty() {
            return Err(ToolError::InvalidArguments("recipients required".into()));
        }
        if params.subject.is_empty() {
            return Err(ToolError::InvalidArguments(
                "subject required for new email".into(),
            ));
        }

        let outbound = OutboundEmail {
            from: self.from_addr(),
            to: params.to.iter().map(Address::new).collect(),
            cc: params.cc.iter().map(Address::new).collect(),
            subject: params.subject.clone(),
            text_body: params.body,
            html_body: params.html_body,
            ..Default::default()
        };
        self.sender
            .send(&outbound)
            .await
            .map_err(|e| ToolError::Execution(format!("failed to send email: {e}")))?;

        Ok(sent_result(params.to, params.subject, "Email sent successfully"))
    }
}

#[derive(Debug, Default, Deserialize)]
struct EmailArgs {
    #[serde(default)]
    action: String,
    #[serde(default)]
    to: Vec<String>,
    #[serde(default)]
    cc: Vec<String>,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    html_body: String,
    #[serde(default)]
    include_original: Option<bool>,
}

#[async_trait]
impl Tool for EmailTool {
    fn name(&self) -> &str {
        "send_email"
    }

    fn description(&self) -> String {
        "Sends emails. Can reply to the current email, forward it, or send a new email. \
         Use 'reply' action to respond to sender, 'forward' to send to another address, \
         or 'send' for a new email."
            .into()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["reply", "forward", "send"],
                    "description": "The email action to perform"
                },
                "to": {
                    "type": "array",
                    "description": "Recipient email addresses (required for forward and send)",
                    "items": {"type": "string"}
                },
                "cc": {
                    "type": "array",
                    "description": "CC email addresses",
                    "items": {"type": "string"}
                },
                "subject": {
                    "type": "string",
                    "description": "Email subject (auto-generated for reply/forward if not provided)"
                },
                "body": {
                    "type": "string",
                    "description": "Email body content (plain text)"
                },
                "html_body": {
                    "type": "string",
                    "description": "Email body content (HTML)"
                },
                "include_original": {
                    "type": "boolean",
                    "description": "Include original email in reply/forward (default: true for forward)"
                }
            },
            "required": ["action", "body"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let params: EmailArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        match params.action.as_str() {
            "reply" => {
                let current = ctx.email.as_deref().ok_or_else(|| {
                    ToolError::Execution("no current email to reply to".into())
                })?;
                self.reply(current, params).await
            }
            "forward" => {
                let current = ctx
                    .email
                    .as_deref()
                    .ok_or_else(|| ToolError::Execution("no current email to forward".into()))?;
                self.forward(current, params).await
            }
            "send" => self.send_new(params).await,
            other => Err(ToolError::InvalidArguments(format!(
                "unknown action: {other}"
            ))),
        }
    }
}

/// Prefix a subject, without doubling an existing prefix.
fn prefixed_subject(prefix: &str, subject: &str) -> String {
    if subject.to_lowercase().starts_with(&prefix.to_lowercase()) {
        subject.to_string()
    } else {
        format!("{prefix} {subject}")
    }
}

/// Append the quoted original message to a body.
fn append_original(body: String, current: &InboundEmail) -> String {
    format!(
        "{}\n\n---------- Original Message ----------\nFrom: {}\nDate: {}\nSubject: {}\n\n{}",
        body,
        current.from,
        current.date.format("%a, %d %b %Y %H:%M:%S %z"),
        current.subject,
        current.body(),
    )
}

fn sent_result(to: Vec<String>, subject: String, message: &str) -> Value {
    json!({
        "sent": true,
        "to": to,
        "subject": subject,
        "message": message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::Mutex;

    /// Sender that records every outbound email.
    pub(crate) struct RecordingSender {
        pub sent: Mutex<Vec<OutboundEmail>>,
    }

    impl RecordingSender {
        pub fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmailSender for RecordingSender {
        async fn send(&self, email: &OutboundEmail) -> Result<(), ToolError> {
            self.sent.lock().await.push(email.clone());
            Ok(())
        }
    }

    fn current_email() -> Arc<InboundEmail> {
        Arc::new(InboundEmail {
            message_id: "<orig@example.com>".into(),
            from: Address::with_name("Alice", "alice@example.com"),
            to: vec![Address::new("support@example.com")],
            subject: "Help me".into(),
            text_body: "My widget broke.".into(),
            date: Utc::now(),
            received_at: Utc::now(),
            ..Default::default()
        })
    }

    fn tool() -> (EmailTool, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::new());
        let tool = EmailTool::new(sender.clone(), "bot@example.com", "Emitt");
        (tool, sender)
    }

    #[tokio::test]
    async fn reply_targets_sender_with_re_subject_and_threading() {
        let (tool, sender) = tool();
        let ctx = ToolContext::for_email(1, current_email());

        let result = tool
            .execute(&ctx, json!({"action": "reply", "body": "OK"}))
            .await
            .unwrap();
        assert_eq!(result["sent"], true);
        assert_eq!(result["subject"], "Re: Help me");

        let sent = sender.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to[0].address, "alice@example.com");
        assert_eq!(sent[0].subject, "Re: Help me");
        assert_eq!(sent[0].in_reply_to.as_deref(), Some("<orig@example.com>"));
        assert!(sent[0].text_body.starts_with("OK"));
    }

    #[tokio::test]
    async fn reply_prefers_reply_to_address() {
        let (tool, sender) = tool();
        let mut email = (*current_email()).clone();
        email.reply_to = Some(Address::new("replies@example.com"));
        let ctx = ToolContext::for_email(1, Arc::new(email));

        tool.execute(&ctx, json!({"action": "reply", "body": "noted"}))
            .await
            .unwrap();
        assert_eq!(
            sender.sent.lock().await[0].to[0].address,
            "replies@example.com"
        );
    }

    #[tokio::test]
    async fn reply_does_not_double_re_prefix() {
        let (tool, sender) = tool();
        let mut email = (*current_email()).clone();
        email.subject = "Re: Help me".into();
        let ctx = ToolContext::for_email(1, Arc::new(email));

        tool.execute(&ctx, json!({"action": "reply", "body": "ok"}))
            .await
            .unwrap();
        assert_eq!(sender.sent.lock().await[0].subject, "Re: Help me");
    }

    #[tokio::test]
    async fn reply_with_include_original_quotes_message() {
        let (tool, sender) = tool();
        let ctx = ToolContext::for_email(1, current_email());

        tool.execute(
            &ctx,
            json!({"action": "reply", "body": "See below.", "include_original": true}),
        )
        .await
        .unwrap();

        let body = sender.sent.lock().await[0].text_body.clone();
        assert!(body.starts_with("See below."));
        assert!(body.contains("---------- Original Message ----------"));
        assert!(body.contains("From: Alice <alice@example.com>"));
        assert!(body.contains("Subject: Help me"));
        assert!(body.contains("My widget broke."));
    }

    #[tokio::test]
    async fn reply_without_current_email_fails() {
        let (tool, _) = tool();
        let err = tool
            .execute(
                &ToolContext::detached(),
                json!({"action": "reply", "body": "hi"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no current email to reply to");
    }

    #[tokio::test]
    async fn forward_includes_original_by_default() {
        let (tool, sender) = tool();
        let ctx = ToolContext::for_email(1, current_email());

        tool.execute(
            &ctx,
            json!({"action": "forward", "to": ["ops@example.com"], "body": "FYI"}),
        )
        .await
        .unwrap();

        let sent = sender.sent.lock().await;
        assert_eq!(sent[0].subject, "Fwd: Help me");
        assert_eq!(sent[0].to[0].address, "ops@example.com");
        assert!(sent[0].text_body.contains("Original Message"));
        assert!(sent[0].in_reply_to.is_none());
    }

    #[tokio::test]
    async fn forward_requires_recipients() {
        let (tool, _) = tool();
        let ctx = ToolContext::for_email(1, current_email());
        let err = tool
            .execute(&ctx, json!({"action": "forward", "body": "FYI"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid arguments: recipients required for forward");
    }

    #[tokio::test]
    async fn send_requires_to_and_subject() {
        let (tool, _) = tool();
        let ctx = ToolContext::detached();

        let err = tool
            .execute(&ctx, json!({"action": "send", "body": "hi"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("recipients required"));

        let err = tool
            .execute(
                &ctx,
                json!({"action": "send", "to": ["x@y.com"], "body": "hi"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("subject required"));
    }

    #[tokio::test]
    async fn send_builds_plain_new_email() {
        let (tool, sender) = tool();
        tool.execute(
            &ToolContext::detached(),
            json!({"action": "send", "to": ["x@y.com"], "subject": "Hi", "body": "hello"}),
        )
        .await
        .unwrap();

        let sent = sender.sent.lock().await;
        assert_eq!(sent[0].subject, "Hi");
        assert_eq!(sent[0].text_body, "hello");
        assert!(sent[0].in_reply_to.is_none());
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let (tool, _) = tool();
        let err = tool
            .execute(
                &ToolContext::detached(),
                json!({"action": "teleport", "body": "x"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown action: teleport"));
    }
}
