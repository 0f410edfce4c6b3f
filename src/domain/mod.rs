//! Domain Layer
//!
//! Entities, error taxonomy and the ports the resilience core consumes.

pub mod entities;
pub mod errors;
pub mod ports;
