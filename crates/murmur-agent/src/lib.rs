//! Reply generation for voice sessions.
//!
//! A finalized user turn becomes a [`PipelineJob`]. The per-session
//! [`JobQueue`] runs jobs one at a time through the [`ResponsePipeline`],
//! which streams language-model text and synthesized audio back to the
//! client as outbound envelopes.

pub mod jobs;
pub mod pipeline;

pub use jobs::{JobOutcome, JobQueue, PipelineJob, ReportHook};
pub use pipeline::{Outbound, PipelineReport, ResponsePipeline};
