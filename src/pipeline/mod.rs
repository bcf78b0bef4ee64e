//! Report pipeline: locate the report file, decode it, observe every record.
//!
//! One inbound message flows through:
//! 1. `mime::locate()`: first file-bearing part, streamed
//! 2. `report::decode_file()`: container + XML decode
//! 3. one [`Observation`] per record, in document order
//! 4. the report-level error check
//!
//! Any failure is reported to the sink as a [`StepFailure`] and returned, so
//! the caller can fall back to forwarding the original message.

use chrono::{DateTime, Utc};
use tokio::io::AsyncBufRead;
use tracing::debug;

use crate::error::{DecodeError, PipelineError};
use crate::mime::{self, Attachment, PartBody};
use crate::observation::{Observation, ObservationSink, Outcome, ReportSummary, Step, StepFailure};
use crate::report::{self, RecordExt, ReportExt};

/// Decode one located report file and emit its observations.
///
/// Records are observed before the report-level error check, so a report
/// that flags itself as erroneous still has its rows logged.
pub async fn process<R: AsyncBufRead + Unpin>(
    filename: &str,
    mut body: PartBody<R>,
    sink: &dyn ObservationSink,
) -> Result<ReportSummary, DecodeError> {
    let content = body.read_to_end().await?;
    let report = report::decode_file(filename, &content)?;

    let org = report.org_name();
    let mut passed = 0;
    let mut failed = 0;
    for record in report.records() {
        let outcome = match record.failure() {
            None => {
                passed += 1;
                Outcome::Success
            }
            Some(err) => {
                failed += 1;
                Outcome::Failure(err)
            }
        };
        sink.record(&Observation {
            org: org.to_string(),
            source_ip: record.source_ip(),
            count: u64::from(record.count()),
            outcome,
        });
    }

    if let Some(err) = report.aggregate_error() {
        return Err(err);
    }

    let summary = ReportSummary {
        org: org.to_string(),
        report_id: report.report_id().to_string(),
        begin: timestamp(report.date_range_begin()),
        end: timestamp(report.date_range_end()),
        records: report.records().len(),
        passed,
        failed,
    };
    sink.completed(&summary);
    Ok(summary)
}

fn timestamp(secs: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}

/// Run the whole pipeline over a raw message.
///
/// Reading stops once the report body has been consumed; anything after it
/// in `message` is left unread.
pub async fn analyze<R: AsyncBufRead + Unpin>(
    message: R,
    sink: &dyn ObservationSink,
) -> Result<ReportSummary, PipelineError> {
    let Attachment { filename, body } = match mime::locate(message).await {
        Ok(attachment) => attachment,
        Err(e) => {
            sink.step_failed(&StepFailure {
                step: Step::Locate,
                filename: None,
                error: e.to_string(),
            });
            return Err(e.into());
        }
    };
    debug!(name = %filename, "Located report attachment");

    process(&filename, body, sink).await.map_err(|e| {
        let step = match e {
            DecodeError::Reported(_) => Step::Aggregate,
            _ => Step::Decode,
        };
        sink.step_failed(&StepFailure {
            step,
            filename: Some(filename.clone()),
            error: e.to_string(),
        });
        PipelineError::from(e)
    })
}
