//! Report decoder: turns a located report file into a [`Report`].
//!
//! The container format is chosen from the filename: plain `.xml`,
//! gzip-compressed `.gz`, or a `.zip` archive holding the XML document.

use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use mail_auth::report::{ActionDisposition, DmarcResult, Record, Report};
use tracing::debug;
use zip::ZipArchive;

use crate::error::DecodeError;

/// Upper bound on the decompressed XML document.
pub const MAX_REPORT_BYTES: u64 = 64 * 1024 * 1024;

/// Decode a report file, using its name as the format hint.
pub fn decode_file(filename: &str, content: &[u8]) -> Result<Report, DecodeError> {
    let lower = filename.trim().to_ascii_lowercase();

    let xml = if lower.ends_with(".xml") {
        content.to_vec()
    } else if lower.ends_with(".gz") || lower.ends_with(".gzip") {
        gunzip(content)?
    } else if lower.ends_with(".zip") {
        unzip(content)?
    } else {
        return Err(DecodeError::UnsupportedFormat {
            filename: filename.to_string(),
        });
    };

    debug!(filename, bytes = xml.len(), "Decoded report container");
    parse_xml(&xml)
}

/// Parse an aggregate report XML document.
pub fn parse_xml(xml: &[u8]) -> Result<Report, DecodeError> {
    let xml = xml.strip_prefix(b"\xef\xbb\xbf").unwrap_or(xml);
    Report::parse_xml(xml).map_err(DecodeError::Xml)
}

fn gunzip(content: &[u8]) -> Result<Vec<u8>, DecodeError> {
    read_bounded(GzDecoder::new(content))
}

fn unzip(content: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut archive =
        ZipArchive::new(Cursor::new(content)).map_err(|e| DecodeError::Decompress(e.to_string()))?;
    if archive.is_empty() {
        return Err(DecodeError::Decompress("empty zip archive".into()));
    }

    let index = (0..archive.len())
        .find(|&i| {
            archive
                .name_for_index(i)
                .is_some_and(|name| name.to_ascii_lowercase().ends_with(".xml"))
        })
        .unwrap_or(0);

    let entry = archive
        .by_index(index)
        .map_err(|e| DecodeError::Decompress(e.to_string()))?;
    read_bounded(entry)
}

fn read_bounded(reader: impl Read) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    reader
        .take(MAX_REPORT_BYTES + 1)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Decompress(e.to_string()))?;
    if out.len() as u64 > MAX_REPORT_BYTES {
        return Err(DecodeError::Decompress(format!(
            "report exceeds {MAX_REPORT_BYTES} bytes once decompressed"
        )));
    }
    Ok(out)
}

// ── Predicates ──────────────────────────────────────────────────────

/// Report-level checks.
pub trait ReportExt {
    /// Aggregate-level problem signalled by the reporter, if any.
    fn aggregate_error(&self) -> Option<DecodeError>;
}

impl ReportExt for Report {
    fn aggregate_error(&self) -> Option<DecodeError> {
        let errors: Vec<String> = self
            .error()
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        (!errors.is_empty()).then_some(DecodeError::Reported(errors))
    }
}

/// Per-row checks.
pub trait RecordExt {
    /// Why this row failed DMARC, if it did.
    ///
    /// A row passes when either the aligned DKIM or the aligned SPF result
    /// evaluated to `pass`.
    fn failure(&self) -> Option<String>;
}

impl RecordExt for Record {
    fn failure(&self) -> Option<String> {
        let (dkim, spf) = (self.dmarc_dkim_result(), self.dmarc_spf_result());
        if matches!(dkim, DmarcResult::Pass) || matches!(spf, DmarcResult::Pass) {
            return None;
        }
        Some(format!(
            "dmarc=fail (dkim={}, spf={}, disposition={})",
            result_name(dkim),
            result_name(spf),
            disposition_name(self.action_disposition())
        ))
    }
}

fn result_name(result: DmarcResult) -> &'static str {
    match result {
        DmarcResult::Pass => "pass",
        DmarcResult::Fail => "fail",
        DmarcResult::Unspecified => "none",
    }
}

fn disposition_name(disposition: ActionDisposition) -> &'static str {
    match disposition {
        ActionDisposition::None | ActionDisposition::Unspecified => "none",
        ActionDisposition::Pass => "pass",
        ActionDisposition::Quarantine => "quarantine",
        ActionDisposition::Reject => "reject",
    }
}
