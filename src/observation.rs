//! Observation boundary: structured outcome events for decoded reports.
//!
//! The pipeline never logs directly; it reports to an injected
//! [`ObservationSink`]. [`TracingSink`] turns events into `tracing` records,
//! [`NullSink`] drops them and [`MemorySink`] keeps them for inspection.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

// ── Events ──────────────────────────────────────────────────────────

/// Outcome of one decoded report record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub org: String,
    /// Absent when the reporter left the row's address out.
    pub source_ip: Option<IpAddr>,
    pub count: u64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Pipeline stage that can fail for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Searching the message for its report attachment.
    Locate,
    /// Reading and decoding the attachment.
    Decode,
    /// The decoded report signalled a report-level error.
    Aggregate,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locate => f.write_str("locate"),
            Self::Decode => f.write_str("decode"),
            Self::Aggregate => f.write_str("aggregate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: Step,
    /// Name of the located report file, once known.
    pub filename: Option<String>,
    pub error: String,
}

/// Per-message summary of a report that decoded cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSummary {
    pub org: String,
    pub report_id: String,
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub records: usize,
    pub passed: usize,
    pub failed: usize,
}

// ── Sinks ───────────────────────────────────────────────────────────

/// Receiver of pipeline observations.
pub trait ObservationSink: Send + Sync {
    /// One decoded record.
    fn record(&self, observation: &Observation);

    /// A pipeline step failed; the message will be forwarded.
    fn step_failed(&self, failure: &StepFailure);

    /// The whole report was processed without a pipeline failure.
    fn completed(&self, _summary: &ReportSummary) {}
}

/// Emits observations as structured `tracing` events.
///
/// Events inherit the span of the caller, which carries the sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservationSink for TracingSink {
    fn record(&self, o: &Observation) {
        let source_ip = o.source_ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        match &o.outcome {
            Outcome::Success => {
                info!(org = %o.org, source_ip, success = o.count, "DMARC record")
            }
            Outcome::Failure(err) => warn!(
                org = %o.org,
                source_ip,
                failure = o.count,
                err = %err,
                "DMARC record"
            ),
        }
    }

    fn step_failed(&self, f: &StepFailure) {
        error!(
            step = %f.step,
            name = f.filename.as_deref().unwrap_or(""),
            err = %f.error,
            "Report analysis failed"
        );
    }

    fn completed(&self, s: &ReportSummary) {
        info!(
            org = %s.org,
            report_id = %s.report_id,
            begin = ?s.begin,
            end = ?s.end,
            records = s.records,
            passed = s.passed,
            failed = s.failed,
            "Report analyzed"
        );
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ObservationSink for NullSink {
    fn record(&self, _: &Observation) {}
    fn step_failed(&self, _: &StepFailure) {}
}

/// Event captured by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Record(Observation),
    StepFailed(StepFailure),
    Completed(ReportSummary),
}

/// Keeps every event in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Only the per-record observations.
    pub fn observations(&self) -> Vec<Observation> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Record(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<StepFailure> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::StepFailed(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl ObservationSink for MemorySink {
    fn record(&self, observation: &Observation) {
        self.push(Event::Record(observation.clone()));
    }

    fn step_failed(&self, failure: &StepFailure) {
        self.push(Event::StepFailed(failure.clone()));
    }

    fn completed(&self, summary: &ReportSummary) {
        self.push(Event::Completed(summary.clone()));
    }
}
