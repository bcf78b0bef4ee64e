//! Header blocks of individual MIME parts.

use mail_parser::{MessageParser, MimeHeaders};

use crate::error::LocateError;

/// Content-Transfer-Encoding of a part body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferEncoding {
    /// `7bit`, `8bit`, `binary`, absent or unrecognised.
    #[default]
    Identity,
    Base64,
    QuotedPrintable,
}

impl TransferEncoding {
    fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            _ => Self::Identity,
        }
    }
}

/// The header fields the locator cares about for one part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    /// Lowercased top-level media type; `None` when no Content-Type was sent.
    pub media_type: Option<String>,
    pub boundary: Option<String>,
    /// Lowercased disposition type (`inline`, `attachment`, ...).
    pub disposition: Option<String>,
    /// The `filename` parameter of Content-Disposition.
    pub disposition_filename: Option<String>,
    /// Disposition filename, falling back to the Content-Type `name`.
    pub attachment_name: Option<String>,
    pub encoding: TransferEncoding,
}

impl PartHeaders {
    /// Parse a raw header block, including its terminating blank line.
    pub fn parse(block: &[u8]) -> Result<Self, LocateError> {
        validate_block(block)?;
        if block.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let message = MessageParser::default()
            .parse_headers(block)
            .ok_or_else(|| LocateError::Malformed("unparseable header block".into()))?;
        let part = message.root_part();

        let content_type = part.content_type();
        let disposition = part.content_disposition();

        Ok(Self {
            media_type: content_type.map(|ct| ct.ctype().to_ascii_lowercase()),
            boundary: content_type
                .and_then(|ct| ct.attribute("boundary"))
                .map(str::to_string),
            disposition: disposition.map(|cd| cd.ctype().to_ascii_lowercase()),
            disposition_filename: disposition
                .and_then(|cd| cd.attribute("filename"))
                .map(str::to_string),
            attachment_name: part.attachment_name().map(str::to_string),
            encoding: part
                .content_transfer_encoding()
                .map(TransferEncoding::from_header)
                .unwrap_or_default(),
        })
    }

    pub fn is_multipart(&self) -> bool {
        self.media_type.as_deref() == Some("multipart")
    }

    /// The filename under which this part qualifies as the report file.
    ///
    /// - attachment disposition: `filename`, else Content-Type `name`
    /// - any other disposition: a non-empty `filename` parameter
    /// - no disposition header: never
    pub fn report_filename(&self) -> Option<&str> {
        let disposition = self.disposition.as_deref()?;
        let name = if disposition == "attachment" {
            self.attachment_name.as_deref()
        } else {
            self.disposition_filename.as_deref()
        };
        name.filter(|n| !n.trim().is_empty())
    }

    /// Boundary of a multipart part; a multipart without one cannot be walked.
    pub fn require_boundary(&self) -> Result<Vec<u8>, LocateError> {
        match self.boundary.as_deref() {
            Some(b) if !b.is_empty() => Ok(b.as_bytes().to_vec()),
            _ => Err(LocateError::Malformed(
                "multipart content without a boundary".into(),
            )),
        }
    }
}

/// Every logical header line must be `name: value`; continuation lines
/// start with whitespace.
fn validate_block(block: &[u8]) -> Result<(), LocateError> {
    for line in block.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() || line[0] == b' ' || line[0] == b'\t' {
            continue;
        }
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            return Err(LocateError::Malformed(format!(
                "malformed header line: {}",
                String::from_utf8_lossy(line)
            )));
        };
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
            return Err(LocateError::Malformed(format!(
                "malformed header name: {}",
                String::from_utf8_lossy(name)
            )));
        }
    }
    Ok(())
}
