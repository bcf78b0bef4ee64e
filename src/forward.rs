//! Forward sink: relays an unanalyzable message, unmodified, to the
//! fallback mailbox.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::config::{ForwarderConfig, RelayTls};
use crate::error::ForwardError;

/// One message to relay.
pub struct ForwardJob<'a> {
    /// Envelope sender.
    pub from: &'a str,
    /// Envelope recipients.
    pub to: &'a [String],
    /// The message, read to its end by the sink.
    pub message: &'a mut (dyn AsyncRead + Send + Unpin),
}

impl std::fmt::Debug for ForwardJob<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardJob")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

/// Outbound delivery of a raw message.
#[async_trait]
pub trait ForwardSink: Send + Sync {
    async fn forward(&self, job: ForwardJob<'_>) -> Result<(), ForwardError>;
}

// ── SMTP relay ──────────────────────────────────────────────────────

/// Relays over a secured SMTP submission connection via lettre.
///
/// lettre's transport is blocking, so each send runs on the blocking pool.
/// Every send opens and closes its own connection.
#[derive(Clone)]
pub struct SmtpRelay {
    transport: Arc<SmtpTransport>,
}

impl SmtpRelay {
    pub fn new(config: &ForwarderConfig) -> Result<Self, ForwardError> {
        let builder = match config.tls {
            RelayTls::Implicit => SmtpTransport::relay(&config.host),
            RelayTls::StartTls => SmtpTransport::starttls_relay(&config.host),
        }
        .map_err(|e| ForwardError::Transport(format!("SMTP relay error: {e}")))?
        .port(config.port)
        .timeout(Some(config.timeout));

        let builder = match &config.credentials {
            Some(creds) => builder
                .credentials(Credentials::new(
                    creds.username.clone(),
                    creds.password.expose_secret().to_string(),
                ))
                .authentication(vec![Mechanism::Plain]),
            None => builder,
        };

        debug!(
            host = %config.host,
            port = config.port,
            tls = ?config.tls,
            "Configured fallback relay"
        );
        Ok(Self::from_transport(builder.build()))
    }

    /// Wrap an already configured transport.
    pub fn from_transport(transport: SmtpTransport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }
}

#[async_trait]
impl ForwardSink for SmtpRelay {
    async fn forward(&self, job: ForwardJob<'_>) -> Result<(), ForwardError> {
        let envelope = envelope(job.from, job.to)?;

        // Read everything before dialing out: a broken inbound stream must
        // not leave a half-sent transaction behind.
        let mut message = Vec::new();
        job.message.read_to_end(&mut message).await?;
        let bytes = message.len();
        let body = data_body(message);

        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || transport.send_raw(&envelope, &body))
            .await
            .map_err(|e| ForwardError::Task(e.to_string()))?
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        info!(bytes, recipients = job.to.len(), "Forwarded message to fallback mailbox");
        Ok(())
    }
}

/// lettre closes DATA with `CRLF . CRLF`, which adds a line break after the
/// body. A message that already ends in CRLF gives that one back so the
/// receiver sees the original bytes. An empty message cannot be expressed in
/// DATA this way and arrives as a single CRLF.
fn data_body(mut message: Vec<u8>) -> Vec<u8> {
    if message.ends_with(b"\r\n") {
        message.truncate(message.len() - 2);
    }
    message
}

fn parse_address(address: &str) -> Result<Address, ForwardError> {
    address
        .trim()
        .parse()
        .map_err(|e: lettre::address::AddressError| ForwardError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Build the SMTP envelope for a forward.
pub fn envelope(from: &str, to: &[String]) -> Result<Envelope, ForwardError> {
    let sender = parse_address(from)?;
    let recipients = to
        .iter()
        .map(|r| parse_address(r))
        .collect::<Result<Vec<_>, _>>()?;
    Envelope::new(Some(sender), recipients).map_err(|e| ForwardError::Envelope(e.to_string()))
}
