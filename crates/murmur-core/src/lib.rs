//! Core types, config, errors, wire protocol, and conversation model for Murmur.

pub mod config;
pub mod conversation;
pub mod dedup;
pub mod error;
pub mod protocol;
