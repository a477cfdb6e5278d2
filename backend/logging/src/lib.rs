//! Telemetry and structured logging components for JobForge.
//!
//! Handles log redaction, JSON output generation, file rotation, and the job lifecycle event trail.

pub mod job_events;
pub mod logger;
pub mod redact;

pub use job_events::{EventLogEntry, EventLogger};
pub use logger::init_logger;
pub use redact::redact_sensitive_data;
