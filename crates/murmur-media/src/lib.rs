//! Media handling for inbound voice streams.

pub mod recording;

pub use recording::{RecordingSink, RecordingSummary};
