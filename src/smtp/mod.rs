//! Inbound SMTP receiver.

pub mod server;
mod session;

use async_trait::async_trait;

use crate::email::InboundEmail;
use crate::error::ProcessError;

pub use server::SmtpServer;

/// Receives each successfully parsed inbound email.
///
/// Called from a spawned task after the SMTP reply has been sent; processing
/// latency never blocks the session.
#[async_trait]
pub trait EmailHandler: Send + Sync {
    async fn handle(&self, email: InboundEmail) -> Result<(), ProcessError>;
}
