//! SMTP server — listener, per-connection tasks, optional STARTTLS.

use std::sync::Arc;

use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::email::Parser;
use crate::error::SmtpError;
use crate::smtp::session::{greet, run_session, SessionConfig, SessionEnd};
use crate::smtp::EmailHandler;

/// SMTP server for receiving inbound emails.
pub struct SmtpServer {
    addr: String,
    session_config: SessionConfig,
    handler: Arc<dyn EmailHandler>,
    parser: Parser,
    tls: Option<TlsAcceptor>,
}

impl SmtpServer {
    /// Build a server from config. A broken TLS certificate is logged and
    /// STARTTLS is disabled, matching the rest of the intake path's
    /// keep-accepting posture.
    pub fn new(cfg: &ServerConfig, handler: Arc<dyn EmailHandler>) -> Self {
        let tls = if cfg.tls.enabled {
            match load_tls(&cfg.tls.cert_file, &cfg.tls.key_file) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    error!(error = %e, "Failed to load TLS certificate");
                    None
                }
            }
        } else {
            None
        };

        Self {
            addr: format!("{}:{}", cfg.smtp_host, cfg.smtp_port),
            session_config: SessionConfig {
                domain: "localhost".into(),
                allowed_domains: cfg.allowed_domains.clone(),
                tls_available: tls.is_some(),
            },
            handler,
            parser: Parser::new(),
            tls,
        }
    }

    /// Accept connections until the listener fails or the task is aborted.
    pub async fn run(self: Arc<Self>) -> Result<(), SmtpError> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "SMTP server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                debug!(peer = %peer, "SMTP connection opened");
                if let Err(e) = server.serve_connection(stream).await {
                    debug!(peer = %peer, error = %e, "SMTP session ended with error");
                }
            });
        }
    }

    async fn serve_connection(&self, stream: TcpStream) -> Result<(), SmtpError> {
        let mut io = BufStream::new(stream);
        greet(&mut io, &self.session_config.domain).await?;

        match run_session(&mut io, &self.session_config, &self.handler, self.parser, false).await? {
            SessionEnd::StartTls => {
                let Some(acceptor) = self.tls.clone() else {
                    return Ok(());
                };
                let tls_stream = acceptor.accept(io.into_inner()).await?;
                let mut io = BufStream::new(tls_stream);
                // Fresh transaction state after the upgrade; no new greeting.
                run_session(&mut io, &self.session_config, &self.handler, self.parser, true)
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn load_tls(cert_file: &str, key_file: &str) -> Result<TlsAcceptor, SmtpError> {
    let cert_data = std::fs::read(cert_file)?;
    let key_data = std::fs::read(key_file)?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_data.as_slice()).collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_data.as_slice())?
        .ok_or_else(|| SmtpError::Tls(format!("no private key found in {key_file}")))?;

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SmtpError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
