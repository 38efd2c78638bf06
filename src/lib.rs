//! emitt — inbound email ingestion and automation server.
//!
//! Accepts messages over SMTP, records each one durably, classifies it
//! against an ordered rule set, and hands the match to a processor — most
//! notably an LLM-driven tool-using agent that can read the message, call
//! out to HTTP and SQL, and emit outbound mail.

pub mod config;
pub mod email;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod processor;
pub mod router;
pub mod smtp;
pub mod store;
pub mod tools;
