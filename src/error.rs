//! Error types for emitt.

use thiserror::Error;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    #[error("SMTP error: {0}")]
    Smtp(#[from] SmtpError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),
}

/// Configuration loading errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// MIME parsing errors.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to parse message: {0}")]
    Malformed(String),
}

/// Database errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Email not found: {id}")]
    NotFound { id: i64 },
}

/// Rule compilation errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid {field} pattern for mailbox {mailbox}: {source}")]
    BadPattern {
        mailbox: String,
        field: &'static str,
        source: regex::Error,
    },
}

/// LLM wire errors.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Tool execution errors. Non-fatal; converted to envelope observations.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Execution(String),
}

/// MCP client errors.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to start server: {0}")]
    Spawn(String),

    #[error("failed to write request: {0}")]
    Write(String),

    #[error("MCP error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("tool error: {0}")]
    Tool(String),

    #[error("connection closed before response arrived")]
    ConnectionClosed,
}

/// SMTP server errors.
#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command timed out")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Email processing errors. Mark the email `failed`.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("{0}")]
    Misconfigured(String),

    #[error("{0}")]
    Dispatch(String),

    #[error("max iterations reached without completion")]
    MaxIterations,
}

/// Result type alias for emitt.
pub type Result<T> = std::result::Result<T, Error>;
