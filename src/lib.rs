//! DMARC analyzer: SMTP endpoint for DMARC aggregate reports.

pub mod config;
pub mod error;
pub mod forward;
pub mod mime;
pub mod observation;
pub mod pipeline;
pub mod report;
pub mod server;
pub mod session;
pub mod tee;

#[cfg(test)]
pub(crate) mod fixtures;
