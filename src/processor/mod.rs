//! Processor orchestrator — persist, route, dispatch, finalize.

pub mod tool_loop;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::ProcessorConfig;
use crate::email::{InboundEmail, Parser};
use crate::error::ProcessError;
use crate::llm::ChatModel;
use crate::router::Router;
use crate::smtp::EmailHandler;
use crate::store::{EmailStatus, EmailStore, ProcessingLog, StoredEmail};
use crate::tools::{ToolContext, ToolRegistry};

pub use tool_loop::{ToolLoop, DEFAULT_MAX_ITERATIONS};

/// Deadline for one processor dispatch, measured from DATA receipt.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Orchestrates email processing from intake to terminal status.
pub struct Processor {
    store: Arc<EmailStore>,
    router: Arc<Router>,
    registry: Arc<ToolRegistry>,
    tool_loop: ToolLoop,
    parser: Parser,
}

impl Processor {
    pub fn new(
        store: Arc<EmailStore>,
        router: Arc<Router>,
        registry: Arc<ToolRegistry>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        let tool_loop = ToolLoop::new(model, Arc::clone(&registry), Arc::clone(&store));
        Self {
            store,
            router,
            registry,
            tool_loop,
            parser: Parser::new(),
        }
    }

    /// Handle one incoming email: store it, route it, dispatch the selected
    /// processor, and record the terminal status.
    pub async fn process(&self, inbound: InboundEmail) -> Result<(), ProcessError> {
        let started = Instant::now();

        let mut record = StoredEmail::from_inbound(&inbound);
        self.store.save_email(&mut record)?;
        let email_id = record.id;

        // Attachment bytes are best-effort; a bad attachment must not lose
        // the email.
        for att in &inbound.attachments {
            if let Err(e) = self.store.save_attachment(email_id, att) {
                warn!(email_id, filename = %att.filename, error = %e, "Failed to save attachment");
            }
        }

        let route = self.router.route(&inbound);
        self.store.set_mailbox(email_id, &route.mailbox_name)?;
        self.store.update_status(email_id, EmailStatus::Processing)?;

        let mailbox = route.mailbox_name.clone();
        let ctx = ToolContext::for_email(email_id, Arc::new(inbound));
        let result = match route.processor_type.as_str() {
            "llm" => self.process_with_llm(&ctx, email_id, route.config.as_ref()).await,
            "forward" => self.process_forward(&ctx, route.config.as_ref()).await,
            "webhook" => self.process_webhook(&ctx, email_id, route.config.as_ref()).await,
            "noop" => {
                info!(email_id, "No-op processor, email stored only");
                Ok(())
            }
            other => {
                // Unrecognized tags fall through; the email is kept as
                // stored-only rather than failed.
                warn!(email_id, processor = %other, "Unrecognized processor type, email stored only");
                Ok(())
            }
        };

        let final_status = if result.is_err() {
            EmailStatus::Failed
        } else {
            EmailStatus::Completed
        };
        if let Err(ref e) = result {
            error!(email_id, error = %e, "Processing failed");
        }
        // Best-effort: a failed status write must not overwrite the dispatch
        // outcome.
        if let Err(e) = self.store.update_status(email_id, final_status) {
            error!(email_id, error = %e, "Failed to update final status");
        }

        info!(
            email_id,
            mailbox = %mailbox,
            status = final_status.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Email processing completed"
        );

        result
    }

    async fn process_with_llm(
        &self,
        ctx: &ToolContext,
        email_id: i64,
        cfg: Option<&ProcessorConfig>,
    ) -> Result<(), ProcessError> {
        let cfg = cfg.ok_or_else(|| {
            ProcessError::Misconfigured("llm processor requires a mailbox config".into())
        })?;
        let email = ctx
            .email
            .as_deref()
            .ok_or_else(|| ProcessError::Misconfigured("no email bound to dispatch".into()))?;

        let started = Instant::now();
        let context_json = serde_json::to_string_pretty(&email.context())
            .unwrap_or_else(|_| "{}".to_string());
        let user_message = format!(
            "Process the following email:\n\n{context_json}\n\n\
             Analyze the email and take appropriate actions using the available tools."
        );

        self.save_log(ProcessingLog {
            email_id,
            step: "llm_start".into(),
            input: Some(user_message.clone()),
            created_at: Utc::now(),
            ..Default::default()
        });

        let result = self
            .tool_loop
            .run(
                ctx,
                &cfg.system_prompt,
                &user_message,
                &cfg.tools,
                DEFAULT_MAX_ITERATIONS,
            )
            .await;

        let mut log = ProcessingLog {
            email_id,
            step: "llm_complete".into(),
            duration_ms: started.elapsed().as_millis() as i64,
            created_at: Utc::now(),
            ..Default::default()
        };
        match &result {
            Ok(output) => log.output = Some(output.clone()),
            Err(e) => log.error = Some(e.to_string()),
        }
        self.save_log(log);

        result.map(|_| ())
    }

    async fn process_forward(
        &self,
        ctx: &ToolContext,
        cfg: Option<&ProcessorConfig>,
    ) -> Result<(), ProcessError> {
        let forward_to = cfg.map(|c| c.forward_to.as_str()).unwrap_or_default();
        if forward_to.is_empty() {
            return Err(ProcessError::Misconfigured(
                "forward_to address not configured".into(),
            ));
        }

        let args = json!({
            "action": "forward",
            "to": [forward_to],
            "body": "Forwarded email - see original below.",
            "include_original": true,
        });
        let envelope = self.registry.execute(ctx, "send_email", args).await;
        envelope_to_result(envelope)
    }

    async fn process_webhook(
        &self,
        ctx: &ToolContext,
        email_id: i64,
        cfg: Option<&ProcessorConfig>,
    ) -> Result<(), ProcessError> {
        let webhook_url = cfg.map(|c| c.webhook_url.as_str()).unwrap_or_default();
        if webhook_url.is_empty() {
            return Err(ProcessError::Misconfigured("webhook_url not configured".into()));
        }
        let email = ctx
            .email
            .as_deref()
            .ok_or_else(|| ProcessError::Misconfigured("no email bound to dispatch".into()))?;

        let args = json!({
            "method": "POST",
            "url": webhook_url,
            "json_body": {
                "event": "email.received",
                "email_id": email_id,
                "email": email.context(),
            },
        });
        let envelope = self.registry.execute(ctx, "http_request", args).await;
        envelope_to_result(envelope)
    }

    /// Replay pending emails — the recovery path for crashes between intake
    /// and completion. Each row is re-parsed from its raw bytes; the stale
    /// row is deleted before re-entering `process`, which re-inserts it.
    pub async fn process_pending(&self, limit: usize) -> Result<(), ProcessError> {
        let pending = self.store.get_pending(limit)?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "Processing pending emails");

        for row in pending {
            let inbound = match self.parser.parse(&row.raw_message) {
                Ok(inbound) => inbound,
                Err(e) => {
                    error!(email_id = row.id, error = %e, "Failed to parse stored email");
                    if let Err(e) = self.store.update_status(row.id, EmailStatus::Failed) {
                        error!(email_id = row.id, error = %e, "Failed to mark email failed");
                    }
                    continue;
                }
            };

            self.store.delete_email(row.id)?;
            if let Err(e) = self.process(inbound).await {
                error!(email_id = row.id, error = %e, "Failed to process pending email");
            }
        }

        Ok(())
    }

    fn save_log(&self, log: ProcessingLog) {
        if let Err(e) = self.store.save_processing_log(&log) {
            warn!(email_id = log.email_id, step = %log.step, error = %e, "Failed to save processing log");
        }
    }
}

#[async_trait]
impl EmailHandler for Processor {
    async fn handle(&self, email: InboundEmail) -> Result<(), ProcessError> {
        self.process(email).await
    }
}

/// Turn a tool-result envelope into a dispatch result.
fn envelope_to_result(envelope: serde_json::Value) -> Result<(), ProcessError> {
    if envelope["success"] == serde_json::Value::Bool(true) {
        Ok(())
    } else {
        let message = envelope["error"].as_str().unwrap_or("tool call failed");
        Err(ProcessError::Dispatch(message.to_string()))
    }
}
