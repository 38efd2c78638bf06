//! Tool abstraction and the uniform result envelope.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::email::InboundEmail;
use crate::error::ToolError;

/// Per-dispatch context threaded through every tool execution.
///
/// The currently-processing email travels here rather than on tool state, so
/// parallel dispatches can never observe each other's message.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub email_id: Option<i64>,
    pub email: Option<Arc<InboundEmail>>,
}

impl ToolContext {
    /// Context for processing a specific stored email.
    pub fn for_email(email_id: i64, email: Arc<InboundEmail>) -> Self {
        Self {
            email_id: Some(email_id),
            email: Some(email),
        }
    }

    /// Context with no current email bound.
    pub fn detached() -> Self {
        Self::default()
    }
}

/// A named, schema-described capability invocable by the LLM.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable tool identifier.
    fn name(&self) -> &str;

    /// Human description shown to the model.
    fn description(&self) -> String;

    /// JSON schema for the tool's arguments.
    fn parameters(&self) -> Value;

    /// Run the tool. On success, returns the payload that the registry wraps
    /// as the envelope's `data`.
    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError>;
}

/// Wrap a payload as a success envelope.
pub fn success_envelope(data: Value) -> Value {
    json!({"success": true, "data": data})
}

/// Wrap an error message as a failure envelope.
pub fn error_envelope(error: impl std::fmt::Display) -> Value {
    json!({"success": false, "error": error.to_string()})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_are_well_formed() {
        let ok = success_envelope(json!({"rows": []}));
        assert_eq!(ok["success"], true);
        assert!(ok["data"].is_object());
        assert!(ok.get("error").is_none());

        let err = error_envelope("boom");
        assert_eq!(err["success"], false);
        assert_eq!(err["error"], "boom");
        assert!(err.get("data").is_none());
    }
}
