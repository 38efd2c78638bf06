//! The LLM tool-use loop — multi-turn conversation driving a
//! function-calling model against the tool registry.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::llm::{ChatMessage, ChatModel};
use crate::store::{EmailStore, ToolCallRecord};
use crate::tools::tool::error_envelope;
use crate::tools::{ToolContext, ToolRegistry};

/// Iteration cap applied when the caller passes zero.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Runs conversations with tool calling.
pub struct ToolLoop {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    store: Arc<EmailStore>,
}

impl ToolLoop {
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        store: Arc<EmailStore>,
    ) -> Self {
        Self {
            model,
            registry,
            store,
        }
    }

    /// Run the loop until the model stops, or fail after `max_iterations`
    /// model calls.
    ///
    /// Tool errors are not fatal: they are appended to the conversation as
    /// `{success:false, error}` observations and the loop continues. Every
    /// tool call is recorded against the email in `ctx`.
    pub async fn run(
        &self,
        ctx: &ToolContext,
        system_prompt: &str,
        user_message: &str,
        allowed_tools: &[String],
        max_iterations: usize,
    ) -> Result<String, ProcessError> {
        let max_iterations = if max_iterations == 0 {
            DEFAULT_MAX_ITERATIONS
        } else {
            max_iterations
        };

        let tools = self.registry.definitions(allowed_tools).await;
        let mut messages = vec![ChatMessage::user(user_message)];

        for iteration in 0..max_iterations {
            let turn = self.model.chat(system_prompt, &messages, &tools).await?;
            debug!(
                iteration,
                finish_reason = %turn.finish_reason,
                tool_calls = turn.tool_calls.len(),
                "Model turn received"
            );

            messages.push(ChatMessage::assistant(
                turn.content.clone(),
                turn.tool_calls.clone(),
            ));

            if turn.finish_reason == "stop" || turn.tool_calls.is_empty() {
                return Ok(turn.content.unwrap_or_default());
            }

            for call in &turn.tool_calls {
                info!(tool = %call.name, call_id = %call.id, "Executing tool call");

                let started = Instant::now();
                let envelope = match serde_json::from_str::<Value>(&call.arguments) {
                    Ok(args) => self.registry.execute(ctx, &call.name, args).await,
                    Err(e) => error_envelope(format!("invalid arguments: {e}")),
                };
                let duration_ms = started.elapsed().as_millis() as i64;

                self.record_tool_call(ctx, call, &envelope, duration_ms);
                messages.push(ChatMessage::tool_result(&call.id, envelope.to_string()));
            }
        }

        Err(ProcessError::MaxIterations)
    }

    fn record_tool_call(
        &self,
        ctx: &ToolContext,
        call: &crate::llm::ToolCallRequest,
        envelope: &Value,
        duration_ms: i64,
    ) {
        let Some(email_id) = ctx.email_id else {
            return;
        };
        let error = (envelope["success"] == Value::Bool(false))
            .then(|| envelope["error"].as_str().unwrap_or_default().to_string());
        let record = ToolCallRecord {
            email_id,
            tool_name: call.name.clone(),
            arguments: Some(call.arguments.clone()),
            result: Some(envelope.to_string()),
            error,
            duration_ms,
            called_at: Utc::now(),
            ..Default::default()
        };
        if let Err(e) = self.store.save_tool_call(&record) {
            warn!(email_id, tool = %call.name, error = %e, "Failed to record tool call");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::{Address, InboundEmail};
    use crate::error::{LlmError, ToolError};
    use crate::llm::{ChatTurn, ToolCallRequest, ToolDefinition};
    use crate::store::{Database, StoredEmail};
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Model that plays back scripted turns.
    struct ScriptedModel {
        turns: Mutex<Vec<ChatTurn>>,
        calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<ChatTurn>) -> Self {
            Self {
                turns: Mutex::new(turns),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(
            &self,
            _system: &str,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<ChatTurn, LlmError> {
            *self.calls.lock().unwrap() += 1;
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                Ok(ChatTurn {
                    content: Some("done".into()),
                    tool_calls: Vec::new(),
                    finish_reason: "stop".into(),
                })
            } else {
                Ok(turns.remove(0))
            }
        }
    }

    struct CountingTool {
        executions: Arc<Mutex<Vec<Value>>>,
        fail: bool,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "counter"
        }
        fn description(&self) -> String {
            "Counts executions".into()
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
            self.executions.lock().unwrap().push(args);
            if self.fail {
                Err(ToolError::Execution("tool exploded".into()))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    fn tool_call(id: &str, name: &str, args: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    fn turn_with_calls(calls: Vec<ToolCallRequest>) -> ChatTurn {
        ChatTurn {
            content: None,
            tool_calls: calls,
            finish_reason: "tool_calls".into(),
        }
    }

    async fn loop_fixture(
        turns: Vec<ChatTurn>,
        fail_tool: bool,
    ) -> (ToolLoop, Arc<Mutex<Vec<Value>>>, Arc<EmailStore>, i64) {
        let store = Arc::new(EmailStore::new(Arc::new(Database::open_in_memory().unwrap())));
        let inbound = InboundEmail {
            message_id: "<loop@x>".into(),
            from: Address::new("a@b.com"),
            ..Default::default()
        };
        let mut record = StoredEmail::from_inbound(&inbound);
        store.save_email(&mut record).unwrap();

        let registry = Arc::new(ToolRegistry::new());
        let executions = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(Arc::new(CountingTool {
                executions: Arc::clone(&executions),
                fail: fail_tool,
            }))
            .await;

        let tool_loop = ToolLoop::new(
            Arc::new(ScriptedModel::new(turns)),
            registry,
            Arc::clone(&store),
        );
        (tool_loop, executions, store, record.id)
    }

    #[tokio::test]
    async fn returns_text_on_stop() {
        let (tool_loop, _, _, email_id) = loop_fixture(
            vec![ChatTurn {
                content: Some("all done".into()),
                tool_calls: Vec::new(),
                finish_reason: "stop".into(),
            }],
            false,
        )
        .await;

        let ctx = ToolContext {
            email_id: Some(email_id),
            email: None,
        };
        let result = tool_loop.run(&ctx, "sys", "user", &[], 10).await.unwrap();
        assert_eq!(result, "all done");
    }

    #[tokio::test]
    async fn executes_tool_calls_then_returns_final_text() {
        let (tool_loop, executions, store, email_id) = loop_fixture(
            vec![
                turn_with_calls(vec![tool_call("c1", "counter", r#"{"n":1}"#)]),
                ChatTurn {
                    content: Some("finished".into()),
                    tool_calls: Vec::new(),
                    finish_reason: "stop".into(),
                },
            ],
            false,
        )
        .await;

        let ctx = ToolContext {
            email_id: Some(email_id),
            email: None,
        };
        let result = tool_loop.run(&ctx, "sys", "user", &[], 10).await.unwrap();
        assert_eq!(result, "finished");
        assert_eq!(executions.lock().unwrap().len(), 1);

        // Exactly one tool-call record per emitted call.
        let records = store.get_tool_calls(email_id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tool_name, "counter");
        assert!(records[0].error.is_none());
    }

    #[tokio::test]
    async fn tool_error_continues_the_loop() {
        let (tool_loop, _, store, email_id) = loop_fixture(
            vec![
                turn_with_calls(vec![tool_call("c1", "counter", "{}")]),
                ChatTurn {
                    content: Some("recovered".into()),
                    tool_calls: Vec::new(),
                    finish_reason: "stop".into(),
                },
            ],
            true,
        )
        .await;

        let ctx = ToolContext {
            email_id: Some(email_id),
            email: None,
        };
        let result = tool_loop.run(&ctx, "sys", "user", &[], 10).await.unwrap();
        assert_eq!(result, "recovered");

        let records = store.get_tool_calls(email_id).unwrap();
        assert_eq!(records[0].error.as_deref(), Some("tool exploded"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_observation_not_a_failure() {
        let (tool_loop, _, store, email_id) = loop_fixture(
            vec![
                turn_with_calls(vec![tool_call("c1", "missing_tool", "{}")]),
                ChatTurn {
                    content: Some("ok".into()),
                    tool_calls: Vec::new(),
                    finish_reason: "stop".into(),
                },
            ],
            false,
        )
        .await;

        let ctx = ToolContext {
            email_id: Some(email_id),
            email: None,
        };
        assert_eq!(tool_loop.run(&ctx, "", "user", &[], 10).await.unwrap(), "ok");
        let records = store.get_tool_calls(email_id).unwrap();
        assert_eq!(records[0].error.as_deref(), Some("unknown tool: missing_tool"));
    }

    #[tokio::test]
    async fn exhausting_iterations_fails() {
        // Model that always asks for another tool call.
        let endless: Vec<ChatTurn> = (0..5)
            .map(|i| turn_with_calls(vec![tool_call(&format!("c{i}"), "counter", "{}")]))
            .collect();
        let (tool_loop, executions, _, email_id) = loop_fixture(endless, false).await;

        let ctx = ToolContext {
            email_id: Some(email_id),
            email: None,
        };
        let err = tool_loop.run(&ctx, "", "user", &[], 3).await.unwrap_err();
        assert_eq!(err.to_string(), "max iterations reached without completion");
        // Three model calls, three tool executions, then the cap.
        assert_eq!(executions.lock().unwrap().len(), 3);
    }
}
