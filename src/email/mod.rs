//! Email domain types and MIME parsing.

pub mod model;
pub mod parser;

pub use model::{Address, Attachment, AttachmentInfo, EmailContext, InboundEmail, OutboundEmail};
pub use parser::Parser;
