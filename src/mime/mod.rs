//! Attachment locator: single-pass search for the first file-bearing part
//! of a mail message.
//!
//! The message is read line by line. Headers are buffered one block at a
//! time; part bodies that do not qualify are skipped line by line and never
//! kept. Nested multiparts are walked depth-first with a boundary stack, and
//! the search stops at the first qualifying part, leaving its body (and
//! everything after it) unread.

pub mod body;
pub mod headers;

pub use body::PartBody;
pub use headers::{PartHeaders, TransferEncoding};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

use crate::error::LocateError;

/// The first file-bearing part of a message.
pub struct Attachment<R> {
    pub filename: String,
    pub body: PartBody<R>,
}

impl<R> std::fmt::Debug for Attachment<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Find the first part that is an inline part with a filename or an
/// attachment with a resolvable name.
///
/// Returns as soon as the qualifying part's headers are parsed, with the
/// body stream positioned at the start of that part's body.
pub async fn locate<R: AsyncBufRead + Unpin>(mut reader: R) -> Result<Attachment<R>, LocateError> {
    let block = read_header_block(&mut reader).await?;
    if block.is_empty() {
        return Err(LocateError::Malformed("empty message".into()));
    }
    let top = PartHeaders::parse(&block)?;

    if !top.is_multipart() {
        // A single-part message is its own (only) part.
        let Some(filename) = top.report_filename().map(str::to_string) else {
            return Err(LocateError::NoAttachmentFound);
        };
        return Ok(Attachment {
            filename,
            body: PartBody::new(reader, None, top.encoding),
        });
    }

    let mut boundaries = vec![top.require_boundary()?];
    while next_part(&mut reader, &mut boundaries).await? {
        let block = read_header_block(&mut reader).await?;
        let headers = PartHeaders::parse(&block)?;

        if headers.is_multipart() {
            boundaries.push(headers.require_boundary()?);
            continue;
        }

        if let Some(filename) = headers.report_filename() {
            let filename = filename.to_string();
            let boundary = boundaries.pop();
            return Ok(Attachment {
                filename,
                body: PartBody::new(reader, boundary, headers.encoding),
            });
        }

        trace!(
            media_type = headers.media_type.as_deref().unwrap_or("text"),
            "Skipping part without a filename"
        );
    }

    Err(LocateError::NoAttachmentFound)
}

/// Skip lines up to the next delimiter of the innermost boundary.
///
/// Returns `true` when a new part starts, `false` once the outermost
/// multipart is closed.
async fn next_part<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    boundaries: &mut Vec<Vec<u8>>,
) -> Result<bool, LocateError> {
    let mut line = Vec::new();
    loop {
        let Some(boundary) = boundaries.last() else {
            return Ok(false);
        };

        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(LocateError::Malformed(
                "message ended before the closing boundary".into(),
            ));
        }

        match delimiter(&line, boundary) {
            Some(Delimiter::Next) => return Ok(true),
            Some(Delimiter::Close) => {
                // The rest of the enclosing part is epilogue.
                boundaries.pop();
            }
            None => {}
        }
    }
}

/// Read a header block up to and including its blank line.
///
/// An empty stream yields an empty block; a block cut off by the end of
/// the stream is malformed.
async fn read_header_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, LocateError> {
    let mut block = Vec::new();
    loop {
        let start = block.len();
        if reader.read_until(b'\n', &mut block).await? == 0 {
            if block.is_empty() {
                return Ok(block);
            }
            return Err(LocateError::Malformed(
                "message ended inside a header block".into(),
            ));
        }
        if strip_eol(&block[start..]).is_empty() {
            return Ok(block);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delimiter {
    Next,
    Close,
}

/// Classify `line` as a delimiter of `boundary` (RFC 2046 §5.1.1),
/// tolerating trailing transport padding.
pub(crate) fn delimiter(line: &[u8], boundary: &[u8]) -> Option<Delimiter> {
    let rest = line.strip_prefix(b"--")?.strip_prefix(boundary)?;
    let (kind, rest) = match rest.strip_prefix(b"--") {
        Some(rest) => (Delimiter::Close, rest),
        None => (Delimiter::Next, rest),
    };
    rest.iter()
        .all(u8::is_ascii_whitespace)
        .then_some(kind)
}

pub(crate) fn strip_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
