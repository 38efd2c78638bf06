//! MCP integration — external tool servers as child processes speaking
//! line-delimited JSON-RPC 2.0 over stdio.

pub mod client;
pub mod protocol;

pub use client::{McpClient, McpTool, ServerConnection};
