//! Durable storage — SQLite-backed email, log, and tool-call records.

pub mod db;
pub mod emails;
pub mod models;

pub use db::Database;
pub use emails::EmailStore;
pub use models::{
    EmailFilter, EmailStats, EmailStatus, ProcessingLog, StoredAttachment, StoredEmail,
    ToolCallRecord,
};
