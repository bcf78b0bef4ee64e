//! One inbound SMTP connection: command loop, replies, and the DATA
//! hand-off to the session.

use std::io;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use smtp_proto::request::receiver::RequestReceiver;
use smtp_proto::{
    AUTH_PLAIN, EXT_8BIT_MIME, EXT_ENHANCED_STATUS_CODES, EXT_PIPELINING, EXT_SIZE, EhloResponse,
    Error as ProtocolError, Request,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, trace, warn};

use super::data::DataReader;
use super::timeout::ReadTimeout;
use crate::config::ListenerConfig;
use crate::session::{Backend, Session, SessionState};

/// Longest command line accepted, CRLF included.
const MAX_COMMAND_LINE: u64 = 2048;

pub struct Connection<R, W> {
    reader: BufReader<ReadTimeout<R>>,
    writer: W,
    backend: Arc<Backend>,
    config: Arc<ListenerConfig>,
    session: Session,
    greeted: bool,
    recipients: usize,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, backend: &Arc<Backend>, config: Arc<ListenerConfig>) -> Self {
        Self {
            reader: BufReader::new(ReadTimeout::new(reader, config.read_timeout)),
            writer,
            session: backend.anonymous_login(),
            backend: Arc::clone(backend),
            config,
            greeted: false,
            recipients: 0,
        }
    }

    /// Serve the connection until QUIT, disconnect or timeout.
    pub async fn run(mut self) -> io::Result<()> {
        let result = self.serve().await;
        self.session.logout();

        match result {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!(err = %e, "Closing idle connection");
                // Best effort; the peer may be gone already.
                let _ = self
                    .reply(421, "4.4.2 Idle timeout, closing connection")
                    .await;
                Ok(())
            }
            other => other,
        }
    }

    async fn serve(&mut self) -> io::Result<()> {
        let greeting = format!("{} ESMTP Service Ready", self.config.domain);
        self.reply(220, &greeting).await?;

        let mut line = Vec::new();
        loop {
            line.clear();
            let n = (&mut self.reader)
                .take(MAX_COMMAND_LINE)
                .read_until(b'\n', &mut line)
                .await?;
            if n == 0 {
                debug!("Client disconnected");
                return Ok(());
            }
            if !line.ends_with(b"\n") {
                if n as u64 == MAX_COMMAND_LINE {
                    self.reply(500, "5.5.2 Line too long").await?;
                }
                return Ok(());
            }

            let request = match RequestReceiver::default().ingest(&mut line.iter(), &line) {
                Ok(request) => request,
                Err(e) => {
                    self.reject(e).await?;
                    continue;
                }
            };
            trace!(?request, "Command received");

            if !self.dispatch(request).await? {
                return Ok(());
            }
        }
    }

    /// Reply to a line that did not parse.
    async fn reject(&mut self, error: ProtocolError) -> io::Result<()> {
        match error {
            ProtocolError::UnknownCommand | ProtocolError::InvalidResponse { .. } => {
                self.reply(500, "5.5.1 Invalid command").await
            }
            ProtocolError::InvalidSenderAddress => {
                self.reply(501, "5.1.7 Bad sender's mailbox address syntax").await
            }
            ProtocolError::InvalidRecipientAddress => {
                self.reply(501, "5.1.3 Bad destination mailbox address syntax")
                    .await
            }
            ProtocolError::SyntaxError { syntax } => {
                self.reply(501, &format!("5.5.2 Syntax error, expected: {syntax}"))
                    .await
            }
            ProtocolError::InvalidParameter { param } => {
                self.reply(501, &format!("5.5.4 Invalid parameter {param:?}"))
                    .await
            }
            ProtocolError::UnsupportedParameter { param } => {
                self.reply(504, &format!("5.5.4 Unsupported parameter {param:?}"))
                    .await
            }
            ProtocolError::ResponseTooLong | ProtocolError::NeedsMoreData { .. } => {
                self.reply(500, "5.5.2 Line too long").await
            }
        }
    }

    /// Handle one command. Returns `false` once the connection should close.
    async fn dispatch(&mut self, request: Request<String>) -> io::Result<bool> {
        match request {
            Request::Helo { host } => {
                self.begin(&host);
                let text = format!("{} Hello {host}", self.config.domain);
                self.reply(250, &text).await?;
            }
            Request::Ehlo { host } => {
                self.begin(&host);
                let mut response = EhloResponse::new(self.config.domain.as_str());
                response.capabilities =
                    EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_PIPELINING | EXT_SIZE;
                response.size = self.config.max_message_bytes;

                let mut buf = Vec::with_capacity(128);
                response.write(&mut buf)?;
                self.write(&buf).await?;
            }
            Request::Mail { from } => {
                if !self.greeted {
                    self.reply(503, "5.5.1 Send HELO/EHLO first").await?;
                } else if self.session.state() == SessionState::HasSender {
                    self.reply(503, "5.5.1 Sender already specified").await?;
                } else if from.size > self.config.max_message_bytes {
                    self.reply(552, "5.3.4 Message size exceeds fixed maximum message size")
                        .await?;
                } else {
                    self.session.declare_sender(&from.address);
                    self.recipients = 0;
                    self.reply(250, "2.1.0 Sender OK").await?;
                }
            }
            Request::Rcpt { to } => {
                if self.session.state() != SessionState::HasSender {
                    self.reply(503, "5.5.1 Need MAIL before RCPT").await?;
                } else if self.recipients >= self.config.max_recipients {
                    self.reply(452, "4.5.3 Too many recipients").await?;
                } else {
                    self.session.declare_recipient(&to.address);
                    self.recipients += 1;
                    self.reply(250, "2.1.5 Recipient OK").await?;
                }
            }
            Request::Data => {
                if self.session.state() != SessionState::HasSender || self.recipients == 0 {
                    self.reply(503, "5.5.1 Need RCPT before DATA").await?;
                } else {
                    self.reply(354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;
                    self.data().await?;
                }
            }
            Request::Rset => {
                self.session.reset();
                self.recipients = 0;
                self.reply(250, "2.0.0 OK").await?;
            }
            Request::Noop { .. } => self.reply(250, "2.0.0 OK").await?,
            Request::Vrfy { .. } => {
                self.reply(252, "2.5.0 Cannot VRFY user, but will accept message")
                    .await?
            }
            Request::Help { .. } => {
                self.reply(
                    214,
                    "2.0.0 Commands: HELO EHLO MAIL RCPT DATA RSET NOOP VRFY HELP QUIT",
                )
                .await?
            }
            Request::Quit => {
                self.reply(221, "2.0.0 Bye").await?;
                return Ok(false);
            }
            Request::Auth {
                mechanism,
                initial_response,
            } => {
                let (username, password) = plain_credentials(mechanism, &initial_response);
                match self.backend.login(&username, &password) {
                    Ok(session) => {
                        self.session = session;
                        self.reply(235, "2.7.0 Authentication succeeded").await?;
                    }
                    Err(e) => self.reply(502, &format!("5.5.1 {e}")).await?,
                }
            }
            other => {
                debug!(request = ?other, "Command not implemented");
                self.reply(502, "5.5.1 Command not implemented").await?;
            }
        }
        Ok(true)
    }

    /// HELO/EHLO start a fresh transaction.
    fn begin(&mut self, client: &str) {
        debug!(client, "Client greeted");
        self.greeted = true;
        self.session.reset();
        self.recipients = 0;
    }

    async fn data(&mut self) -> io::Result<()> {
        let mut data = DataReader::new(&mut self.reader, self.config.max_message_bytes);
        self.session.submit_data(&mut data).await;
        let outcome = data.drain().await?;
        self.recipients = 0;

        if outcome.exceeded {
            info!(size = outcome.size, "Rejected oversized message");
            self.reply(552, "5.3.4 Message size exceeds fixed maximum message size")
                .await
        } else {
            debug!(size = outcome.size, "Message received");
            self.reply(250, "2.0.0 Message accepted").await
        }
    }

    async fn reply(&mut self, code: u16, text: &str) -> io::Result<()> {
        self.write(format!("{code} {text}\r\n").as_bytes()).await
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let writer = &mut self.writer;
        tokio::time::timeout(self.config.write_timeout, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
    }
}

/// Username and password from an `AUTH PLAIN` initial response; empty when
/// absent or undecodable.
fn plain_credentials(mechanism: u64, initial: &str) -> (String, String) {
    if mechanism != AUTH_PLAIN {
        return Default::default();
    }
    let Ok(decoded) = STANDARD.decode(initial.trim()) else {
        return Default::default();
    };
    let mut fields = decoded.split(|b| *b == 0).skip(1);
    let username = fields.next().map(String::from_utf8_lossy).unwrap_or_default();
    let password = fields.next().map(String::from_utf8_lossy).unwrap_or_default();
    (username.into_owned(), password.into_owned())
}
