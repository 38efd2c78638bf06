//! HTTP request tool.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum response body size kept in the result.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Makes HTTP requests to external APIs and webhooks.
pub struct HttpTool {
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("default reqwest client"),
        }
    }
}

impl Default for HttpTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct HttpArgs {
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    json_body: Option<Value>,
}

#[derive(Serialize)]
struct HttpResponse {
    status_code: u16,
    status: String,
    headers: BTreeMap<String, String>,
    body: String,
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> String {
        "Makes HTTP requests to external APIs and webhooks. Use this to call REST APIs, \
         trigger webhooks, or fetch data from web services."
            .into()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"],
                    "description": "HTTP method to use"
                },
                "url": {
                    "type": "string",
                    "description": "The URL to send the request to"
                },
                "headers": {
                    "type": "object",
                    "description": "HTTP headers to include in the request",
                    "additionalProperties": {"type": "string"}
                },
                "body": {
                    "type": "string",
                    "description": "Request body (for POST/PUT/PATCH requests)"
                },
                "json_body": {
                    "type": "object",
                    "description": "JSON body (alternative to body, will be serialized)"
                }
            },
            "required": ["method", "url"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let mut params: HttpArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        if params.url.is_empty() {
            return Err(ToolError::InvalidArguments("url is required".into()));
        }
        if !params.url.starts_with("http://") && !params.url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "url must start with http:// or https://".into(),
            ));
        }

        let method = reqwest::Method::from_bytes(params.method.to_uppercase().as_bytes())
            .map_err(|_| ToolError::InvalidArguments(format!("invalid method: {}", params.method)))?;

        let mut request = self.client.request(method, &params.url);

        if let Some(json_body) = params.json_body.take() {
            params
                .headers
                .entry("Content-Type".to_string())
                .or_insert_with(|| "application/json".to_string());
            let body = serde_json::to_string(&json_body)
                .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
            request = request.body(body);
        } else if !params.body.is_empty() {
            request = request.body(params.body.clone());
        }

        for (key, value) in &params.headers {
            request = request.header(key, value);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| ToolError::Execution(format!("request failed: {e}")))?;

        let status = response.status();
        let mut headers = BTreeMap::new();
        for (key, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(key.to_string(), v.to_string());
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ToolError::Execution(format!("failed to read response: {e}")))?
        {
            let remaining = MAX_BODY_BYTES - body.len();
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                break;
            }
            body.extend_from_slice(&chunk);
        }

        let result = HttpResponse {
            status_code: status.as_u16(),
            status: format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or("")),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        };

        serde_json::to_value(result).map_err(|e| ToolError::Execution(e.to_string()))
    }
}
