//! Adapters Layer
//!
//! Inbound HTTP surface and outbound storage implementations.

pub mod inbound;
pub mod outbound;
