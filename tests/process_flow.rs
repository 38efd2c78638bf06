//! End-to-end processing: parse → store → route → LLM loop → outbound mail.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use emitt::config::{MailboxConfig, MatchConfig, ProcessorConfig};
use emitt::email::{OutboundEmail, Parser};
use emitt::error::{LlmError, ToolError};
use emitt::llm::{ChatMessage, ChatModel, ChatTurn, ToolCallRequest, ToolDefinition};
use emitt::processor::Processor;
use emitt::router::Router;
use emitt::store::{Database, EmailStatus, EmailStore};
use emitt::tools::{EmailSender, EmailTool, ToolRegistry};

/// Model scripted to reply with one `send_email` call, then stop.
struct ReplyThenStopModel {
    calls: Mutex<usize>,
}

#[async_trait]
impl ChatModel for ReplyThenStopModel {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatTurn, LlmError> {
        let mut calls = self.calls.lock().await;
        *calls += 1;
        match *calls {
            1 => {
                // First turn sees the rendered email and the declared tools.
                assert_eq!(system, "Reply with OK.");
                assert!(messages[0]
                    .content
                    .as_deref()
                    .unwrap()
                    .contains("Process the following email"));
                assert!(tools.iter().any(|t| t.name == "send_email"));
                Ok(ChatTurn {
                    content: None,
                    tool_calls: vec![ToolCallRequest {
                        id: "call_1".into(),
                        name: "send_email".into(),
                        arguments: json!({"action": "reply", "body": "OK"}).to_string(),
                    }],
                    finish_reason: "tool_calls".into(),
                })
            }
            _ => {
                // Second turn sees the tool-result message keyed to the call.
                let last = messages.last().unwrap();
                assert_eq!(last.role, "tool");
                assert_eq!(last.tool_call_id.as_deref(), Some("call_1"));
                assert!(last.content.as_deref().unwrap().contains("\"success\":true"));
                Ok(ChatTurn {
                    content: Some("done".into()),
                    tool_calls: Vec::new(),
                    finish_reason: "stop".into(),
                })
            }
        }
    }
}

struct RecordingSender {
    sent: Mutex<Vec<OutboundEmail>>,
}

#[async_trait]
impl EmailSender for RecordingSender {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ToolError> {
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

#[tokio::test]
async fn llm_mailbox_replies_and_completes() {
    let store = Arc::new(EmailStore::new(Arc::new(Database::open_in_memory().unwrap())));
    let sender = Arc::new(RecordingSender {
        sent: Mutex::new(Vec::new()),
    });

    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(Arc::new(EmailTool::new(
            sender.clone(),
            "bot@example.com",
            "Emitt",
        )))
        .await;

    let router = Arc::new(
        Router::new(&[MailboxConfig {
            name: "assistant".into(),
            matcher: MatchConfig {
                to: "assistant@.*".into(),
                ..Default::default()
            },
            processor: ProcessorConfig {
                kind: "llm".into(),
                system_prompt: "Reply with OK.".into(),
                tools: vec!["send_email".into()],
                ..Default::default()
            },
        }])
        .unwrap(),
    );

    let processor = Processor::new(
        Arc::clone(&store),
        router,
        registry,
        Arc::new(ReplyThenStopModel {
            calls: Mutex::new(0),
        }),
    );

    // Parse a wire-format message the way the SMTP receiver would.
    let raw = "Message-ID: <orig@example.com>\r\n\
               From: Alice <alice@example.com>\r\n\
               To: assistant@example.com\r\n\
               Subject: =?UTF-8?B?SGVsbG8=?=\r\n\
               Content-Type: text/plain\r\n\
               \r\n\
               hi\r\n";
    let inbound = Parser::new().parse(raw.as_bytes()).unwrap();
    assert_eq!(inbound.subject, "Hello");

    processor.process(inbound).await.unwrap();

    // Stored row reached completed with decoded fields.
    let rows = store.list_emails(&Default::default()).unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.subject, "Hello");
    assert_eq!(row.text_body.trim_end(), "hi");
    assert_eq!(row.status, EmailStatus::Completed);
    assert_eq!(row.mailbox_name.as_deref(), Some("assistant"));
    assert!(row.processed_at.is_some());

    // Exactly one outbound reply to the sender with the Re: subject.
    let sent = sender.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to[0].address, "alice@example.com");
    assert_eq!(sent[0].subject, "Re: Hello");
    assert!(sent[0].text_body.starts_with("OK"));
    assert_eq!(sent[0].in_reply_to.as_deref(), Some("<orig@example.com>"));

    // llm_start then llm_complete, with the final text on the completion log.
    let logs = store.get_logs(row.id).unwrap();
    let steps: Vec<&str> = logs.iter().map(|l| l.step.as_str()).collect();
    assert_eq!(steps, vec!["llm_start", "llm_complete"]);
    assert_eq!(logs[1].output.as_deref(), Some("done"));
    assert!(logs[1].error.is_none());

    // The tool call was recorded against the email.
    let tool_calls = store.get_tool_calls(row.id).unwrap();
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0].tool_name, "send_email");
    assert!(tool_calls[0].error.is_none());
}
