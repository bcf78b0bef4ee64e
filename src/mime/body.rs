//! Streaming access to the decoded body of the located part.

use std::io;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::headers::TransferEncoding;
use super::{delimiter, strip_eol};

/// Base64 that tolerates missing padding and stray trailing bits.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decoded body of one MIME part, read line by line from the message.
///
/// For a part inside a multipart the body ends at the next delimiter of
/// its enclosing boundary (the line break before the delimiter belongs to
/// the delimiter). For a single-part message it ends with the stream.
/// Nothing past the closing delimiter line is read.
pub struct PartBody<R> {
    reader: R,
    boundary: Option<Vec<u8>>,
    decoder: Decoder,
    held: Option<Vec<u8>>,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin> PartBody<R> {
    pub(crate) fn new(reader: R, boundary: Option<Vec<u8>>, encoding: TransferEncoding) -> Self {
        Self {
            reader,
            boundary,
            decoder: Decoder::new(encoding),
            held: None,
            finished: false,
        }
    }

    /// Next chunk of decoded bytes, `None` once the body is exhausted.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        while !self.finished {
            let mut line = Vec::new();
            let n = self.reader.read_until(b'\n', &mut line).await?;

            let at_end = if n == 0 {
                if self.boundary.is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "message ended inside a multipart body",
                    ));
                }
                true
            } else {
                self.boundary
                    .as_deref()
                    .and_then(|b| delimiter(&line, b))
                    .is_some()
            };

            if at_end {
                self.finished = true;
                let mut out = match self.held.take() {
                    // Single-part bodies keep their final line break.
                    Some(last) if self.boundary.is_none() => self.decoder.decode(&last)?,
                    Some(last) => self.decoder.decode(strip_eol(&last))?,
                    None => Vec::new(),
                };
                out.extend(self.decoder.finish()?);
                return Ok((!out.is_empty()).then_some(out));
            }

            if let Some(previous) = self.held.replace(line) {
                let out = self.decoder.decode(&previous)?;
                if !out.is_empty() {
                    return Ok(Some(out));
                }
            }
        }
        Ok(None)
    }

    /// Drain the remaining decoded body into memory.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Give back the underlying reader, positioned wherever the body stopped.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

enum Decoder {
    Identity,
    Base64 { carry: Vec<u8> },
    QuotedPrintable,
}

impl Decoder {
    fn new(encoding: TransferEncoding) -> Self {
        match encoding {
            TransferEncoding::Identity => Self::Identity,
            TransferEncoding::Base64 => Self::Base64 { carry: Vec::new() },
            TransferEncoding::QuotedPrintable => Self::QuotedPrintable,
        }
    }

    /// Decode one raw line (with or without its line break).
    fn decode(&mut self, raw: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Identity => Ok(raw.to_vec()),
            Self::Base64 { carry } => {
                carry.extend(
                    raw.iter()
                        .copied()
                        .filter(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')),
                );
                let whole = carry.len() - carry.len() % 4;
                if whole == 0 {
                    return Ok(Vec::new());
                }
                let out = LENIENT_BASE64
                    .decode(&carry[..whole])
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                carry.drain(..whole);
                Ok(out)
            }
            Self::QuotedPrintable => {
                quoted_printable::decode(raw, quoted_printable::ParseMode::Robust)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            }
        }
    }

    /// Flush whatever an unpadded base64 tail left behind.
    fn finish(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Self::Base64 { carry } if !carry.is_empty() => {
                let tail = std::mem::take(carry);
                LENIENT_BASE64
                    .decode(&tail)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            _ => Ok(Vec::new()),
        }
    }
}
