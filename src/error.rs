//! Error types for the DMARC analyzer.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failures while searching the inbound message for its report attachment.
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("No attachment found")]
    NoAttachmentFound,
}

impl From<std::io::Error> for LocateError {
    fn from(e: std::io::Error) -> Self {
        Self::Malformed(format!("read failed: {e}"))
    }
}

/// Failures while decoding a located report file.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Failed to read attachment body: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported report file: {filename}")]
    UnsupportedFormat { filename: String },

    #[error("Decompression failed: {0}")]
    Decompress(String),

    #[error("Invalid report XML: {0}")]
    Xml(String),

    #[error("Reporter signalled errors: {}", .0.join("; "))]
    Reported(Vec<String>),
}

/// Any failure of the analysis pipeline for one message.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Failures while relaying a message to the fallback mailbox.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Failed to read message for forwarding: {0}")]
    Read(#[from] std::io::Error),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Invalid envelope: {0}")]
    Envelope(String),

    #[error("SMTP relay error: {0}")]
    Transport(String),

    #[error("Forward task failed: {0}")]
    Task(String),
}

/// Inbound authentication errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication not supported")]
    Unsupported,
}
