//! Mail session: per-connection transaction state and the tee-and-replay
//! path that forwards messages the pipeline could not handle.

use std::sync::Arc;

use tokio::io::{AsyncRead, BufReader};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{AuthError, PipelineError};
use crate::forward::{ForwardJob, ForwardSink};
use crate::observation::ObservationSink;
use crate::pipeline;
use crate::tee::TeeReader;

// ── Backend ─────────────────────────────────────────────────────────

/// Where unanalyzable messages go.
#[derive(Clone)]
pub struct Fallback {
    /// Envelope sender used for forwards.
    pub from: String,
    pub to: Vec<String>,
    pub sink: Arc<dyn ForwardSink>,
}

/// Shared, read-only dependencies of every session.
pub struct Backend {
    observer: Arc<dyn ObservationSink>,
    fallback: Option<Fallback>,
}

impl Backend {
    pub fn new(observer: Arc<dyn ObservationSink>) -> Self {
        Self {
            observer,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Credentialed login is never accepted.
    pub fn login(&self, username: &str, _password: &str) -> Result<Session, AuthError> {
        debug!(username, "Rejected login attempt");
        Err(AuthError::Unsupported)
    }

    pub fn anonymous_login(self: &Arc<Self>) -> Session {
        Session {
            backend: Arc::clone(self),
            from: None,
            state: SessionState::Idle,
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HasSender,
    /// A message is being analyzed.
    Data,
    Closed,
}

/// One inbound connection's current transaction.
pub struct Session {
    backend: Arc<Backend>,
    from: Option<String>,
    state: SessionState,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sender(&self) -> Option<&str> {
        self.from.as_deref()
    }

    /// Drop the current transaction.
    pub fn reset(&mut self) {
        self.from = None;
        if self.state != SessionState::Closed {
            self.state = SessionState::Idle;
        }
    }

    /// Record the envelope sender, replacing any earlier one.
    pub fn declare_sender(&mut self, address: &str) {
        self.from = Some(address.to_string());
        self.state = SessionState::HasSender;
    }

    /// Recipients are accepted as-is.
    pub fn declare_recipient(&mut self, address: &str) {
        debug!(to = address, "Recipient declared");
    }

    /// Analyze one message, forwarding it unmodified when analysis fails.
    ///
    /// Every byte the pipeline reads is retained; on failure the retained
    /// bytes followed by the unread rest of `data` reproduce the message
    /// exactly. Never fails: forwarding problems are logged and dropped.
    /// The session is reset afterwards.
    pub async fn submit_data<R>(&mut self, data: &mut R)
    where
        R: AsyncRead + Unpin + Send,
    {
        self.state = SessionState::Data;
        let span = info_span!("message", from = self.from.as_deref().unwrap_or(""));

        async {
            let mut reader = BufReader::new(TeeReader::new(&mut *data));
            let outcome = pipeline::analyze(&mut reader, self.backend.observer.as_ref()).await;

            if let Err(cause) = outcome {
                let tee = reader.into_inner();
                debug!(read = tee.retained().len(), "Replaying message");
                let mut replay = tee.into_replay();
                self.forward(&mut replay, &cause).await;
            }
        }
        .instrument(span)
        .await;

        self.reset();
    }

    /// End the session. Safe to call more than once.
    pub fn logout(&mut self) {
        self.from = None;
        self.state = SessionState::Closed;
    }

    async fn forward(&self, message: &mut (dyn AsyncRead + Send + Unpin), cause: &PipelineError) {
        let Some(fallback) = &self.backend.fallback else {
            warn!(err = %cause, "No fallback mailbox configured, dropping message");
            return;
        };

        let job = ForwardJob {
            from: &fallback.from,
            to: &fallback.to,
            message,
        };
        match fallback.sink.forward(job).await {
            Ok(()) => info!(err = %cause, "Forwarded unanalyzable message"),
            Err(e) => error!(err = %e, cause = %cause, "Failed to forward message"),
        }
    }
}
