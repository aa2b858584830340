//! Voice gateway server.
//!
//! Hosts the streaming voice socket (`/ws`), where each connection runs a
//! transcription session, turn deduplication and the reply pipeline, plus the
//! request/response endpoints for one-shot chat, synthesis and voice listing.

pub mod connection;
pub mod http;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{router, start_gateway};
pub use state::{GatewayState, Providers};
