//! One SMTP session — RFC 5321 command loop over a buffered stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, error, info, warn};

use crate::email::{Address, InboundEmail, Parser};
use crate::error::SmtpError;
use crate::processor::DISPATCH_TIMEOUT;
use crate::smtp::EmailHandler;

/// Maximum accepted message size: 25 MiB.
pub const MAX_MESSAGE_BYTES: usize = 25 * 1024 * 1024;

/// Maximum recipients per transaction.
pub const MAX_RECIPIENTS: usize = 100;

/// Per-read and per-write timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Session-level settings shared by every connection.
pub(crate) struct SessionConfig {
    pub domain: String,
    pub allowed_domains: Vec<String>,
    pub tls_available: bool,
}

/// How a session loop ended.
pub(crate) enum SessionEnd {
    /// Client sent QUIT.
    Quit,
    /// Client negotiated STARTTLS; the caller upgrades the stream and runs a
    /// fresh session.
    StartTls,
    /// Connection closed without QUIT.
    Closed,
}

/// Run the command loop until QUIT, STARTTLS, or disconnect.
///
/// `tls_active` suppresses the STARTTLS advertisement after an upgrade.
pub(crate) async fn run_session<S>(
    io: &mut BufStream<S>,
    cfg: &SessionConfig,
    handler: &Arc<dyn EmailHandler>,
    parser: Parser,
    tls_active: bool,
) -> Result<SessionEnd, SmtpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut from: Option<String> = None;
    let mut rcpts: Vec<String> = Vec::new();

    loop {
        let line = match read_line(io).await? {
            Some(line) => line,
            None => return Ok(SessionEnd::Closed),
        };

        let (verb, param) = split_command(&line);
        match verb.as_str() {
            "HELO" => {
                from = None;
                rcpts.clear();
                write_reply(io, &format!("250 {}", cfg.domain)).await?;
            }
            "EHLO" => {
                from = None;
                rcpts.clear();
                let mut reply = format!(
                    "250-{}\r\n250-SIZE {}\r\n250-8BITMIME\r\n250-AUTH PLAIN",
                    cfg.domain, MAX_MESSAGE_BYTES
                );
                if cfg.tls_available && !tls_active {
                    reply.push_str("\r\n250-STARTTLS");
                }
                reply.push_str("\r\n250 ENHANCEDSTATUSCODES");
                write_reply(io, &reply).await?;
            }
            "STARTTLS" => {
                if !cfg.tls_available || tls_active {
                    write_reply(io, "502 5.5.1 STARTTLS not supported").await?;
                } else {
                    write_reply(io, "220 2.0.0 Ready to start TLS").await?;
                    return Ok(SessionEnd::StartTls);
                }
            }
            "AUTH" => {
                // Any credentials are accepted; this server trusts the
                // network path it is exposed on.
                let mut parts = param.splitn(2, ' ');
                let mechanism = parts.next().unwrap_or_default().to_uppercase();
                if mechanism != "PLAIN" {
                    write_reply(io, "504 5.5.4 Unsupported authentication mechanism").await?;
                    continue;
                }
                if parts.next().is_none() {
                    // Challenge form: read and discard the response line.
                    write_reply(io, "334 ").await?;
                    if read_line(io).await?.is_none() {
                        return Ok(SessionEnd::Closed);
                    }
                }
                write_reply(io, "235 2.7.0 Authentication succeeded").await?;
            }
            "MAIL" => {
                if from.is_some() {
                    write_reply(io, "503 5.5.1 nested MAIL command").await?;
                    continue;
                }
                match parse_path(param, "FROM:") {
                    Some(addr) => {
                        debug!(from = %addr, "MAIL FROM");
                        from = Some(addr);
                        write_reply(io, "250 2.0.0 OK").await?;
                    }
                    None => write_reply(io, "501 5.5.2 Syntax error in MAIL command").await?,
                }
            }
            "RCPT" => {
                if from.is_none() {
                    write_reply(io, "503 5.5.1 Bad sequence of commands").await?;
                    continue;
                }
                if rcpts.len() >= MAX_RECIPIENTS {
                    write_reply(io, "452 4.5.3 Too many recipients").await?;
                    continue;
                }
                let addr = match parse_path(param, "TO:") {
                    Some(addr) => addr,
                    None => {
                        write_reply(io, "501 5.5.2 Syntax error in RCPT command").await?;
                        continue;
                    }
                };
                debug!(to = %addr, "RCPT TO");
                if !domain_allowed(&cfg.allowed_domains, &addr) {
                    warn!(to = %addr, "Rejected: domain not allowed");
                    write_reply(io, "550 5.7.1 Domain not allowed").await?;
                    continue;
                }
                rcpts.push(addr);
                write_reply(io, "250 2.0.0 OK").await?;
            }
            "DATA" => {
                if from.is_none() || rcpts.is_empty() {
                    write_reply(io, "503 5.5.1 Bad sequence of commands").await?;
                    continue;
                }
                write_reply(io, "354 Start mail input; end with <CRLF>.<CRLF>").await?;

                let (raw, truncated) = match read_data(io).await? {
                    Some(data) => data,
                    None => return Ok(SessionEnd::Closed),
                };
                if truncated {
                    write_reply(io, "552 5.3.4 Message too big").await?;
                    from = None;
                    rcpts.clear();
                    continue;
                }

                debug!(size = raw.len(), "Received message data");
                match parser.parse(&raw) {
                    Ok(mut email) => {
                        reconcile_envelope(&mut email, from.as_deref(), &rcpts);
                        info!(
                            from = %email.from.address,
                            to = ?email.to_addresses(),
                            subject = %email.subject,
                            message_id = %email.message_id,
                            "Received email"
                        );
                        dispatch(handler, email);
                        write_reply(io, "250 2.0.0 OK: queued").await?;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to parse email");
                        write_reply(io, "554 5.6.0 Failed to parse message").await?;
                    }
                }
                from = None;
                rcpts.clear();
            }
            "RSET" => {
                from = None;
                rcpts.clear();
                write_reply(io, "250 2.0.0 OK").await?;
            }
            "NOOP" => write_reply(io, "250 2.0.0 OK").await?,
            "VRFY" => write_reply(io, "252 2.0.0 Cannot verify user").await?,
            "QUIT" => {
                write_reply(io, "221 2.0.0 Bye").await?;
                return Ok(SessionEnd::Quit);
            }
            "" => write_reply(io, "500 5.5.2 Syntax error, command unrecognized").await?,
            _ => write_reply(io, "500 5.5.2 Command not recognized").await?,
        }
    }
}

/// Send the initial greeting.
pub(crate) async fn greet<S>(io: &mut BufStream<S>, domain: &str) -> Result<(), SmtpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    write_reply(io, &format!("220 {domain} ESMTP emitt ready")).await
}

/// Hand the parsed email to the processor without blocking the SMTP reply.
/// The email owns its raw bytes, so the session buffer is free to be reused.
fn dispatch(handler: &Arc<dyn EmailHandler>, email: InboundEmail) {
    let handler = Arc::clone(handler);
    let message_id = email.message_id.clone();
    tokio::spawn(async move {
        match tokio::time::timeout(DISPATCH_TIMEOUT, handler.handle(email)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(message_id = %message_id, error = %e, "Failed to handle email");
            }
            Err(_) => {
                error!(message_id = %message_id, "Email processing deadline exceeded");
            }
        }
    });
}

/// Fill in envelope information missing from the headers.
fn reconcile_envelope(email: &mut InboundEmail, from: Option<&str>, rcpts: &[String]) {
    if email.from.address.is_empty() {
        if let Some(from) = from {
            if !from.is_empty() {
                email.from = Address::new(from);
            }
        }
    }
    if email.to.is_empty() {
        email.to = rcpts.iter().map(Address::new).collect();
    }
}

/// Check the recipient's domain (case-insensitive, after the `@`) against
/// the allow-list. An empty list disables the check.
pub(crate) fn domain_allowed(allowed: &[String], addr: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let mut parts = addr.split('@');
    let (Some(_local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    allowed.iter().any(|a| a.eq_ignore_ascii_case(domain))
}

fn split_command(line: &str) -> (String, &str) {
    match line.split_once(' ') {
        Some((verb, rest)) => (verb.to_uppercase(), rest.trim()),
        None => (line.trim().to_uppercase(), ""),
    }
}

/// Extract the address from a `MAIL FROM:<...>` / `RCPT TO:<...>` parameter.
/// Trailing ESMTP parameters (e.g. SIZE=) are ignored.
fn parse_path(param: &str, keyword: &str) -> Option<String> {
    let rest = strip_prefix_ignore_case(param.trim(), keyword)?.trim_start();
    let addr = if let Some(start) = rest.find('<') {
        let end = rest[start..].find('>')? + start;
        &rest[start + 1..end]
    } else {
        rest.split_whitespace().next().unwrap_or_default()
    };
    Some(addr.trim().to_string())
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Read DATA lines until the lone-dot terminator, undoing dot-stuffing.
/// Returns the raw bytes and whether the 25 MiB cap was exceeded (the
/// remainder is consumed either way so the session stays usable).
async fn read_data<S>(io: &mut BufStream<S>) -> Result<Option<(Vec<u8>, bool)>, SmtpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut raw: Vec<u8> = Vec::new();
    let mut truncated = false;
    loop {
        let line = match read_line(io).await? {
            Some(line) => line,
            None => return Ok(None),
        };
        if line == "." {
            return Ok(Some((raw, truncated)));
        }
        let content = line.strip_prefix('.').unwrap_or(&line);
        if truncated || raw.len() + content.len() + 2 > MAX_MESSAGE_BYTES {
            truncated = true;
            continue;
        }
        raw.extend_from_slice(content.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
}

/// Read one CRLF-terminated line under the I/O timeout. `None` on EOF.
async fn read_line<S>(io: &mut BufStream<S>) -> Result<Option<String>, SmtpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut line = String::new();
    let n = tokio::time::timeout(IO_TIMEOUT, io.read_line(&mut line))
        .await
        .map_err(|_| SmtpError::Timeout)??;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

async fn write_reply<S>(io: &mut BufStream<S>, reply: &str) -> Result<(), SmtpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    tokio::time::timeout(IO_TIMEOUT, async {
        io.write_all(reply.as_bytes()).await?;
        io.write_all(b"\r\n").await?;
        io.flush().await
    })
    .await
    .map_err(|_| SmtpError::Timeout)??;
    Ok(())
}
