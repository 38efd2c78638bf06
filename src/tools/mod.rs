//! Tool substrate — the uniform tool interface, registry, and built-ins.

pub mod database;
pub mod email;
pub mod http;
pub mod registry;
pub mod sender;
pub mod tool;

pub use database::{DatabaseSchemaTool, DatabaseTool};
pub use email::EmailTool;
pub use http::HttpTool;
pub use registry::ToolRegistry;
pub use sender::{EmailSender, NoopSender, ResendSender, SmtpSender};
pub use tool::{error_envelope, success_envelope, Tool, ToolContext};
