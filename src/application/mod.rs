//! Application Layer
//!
//! Staged startup and the slots it fills for the rest of the process.

mod bootstrap;
mod core_services;

pub use bootstrap::{
    BootHandles, BootPhase, BootProgress, Bootstrapper, AUTH_CHECK, PRIORITY_APP,
    PRIORITY_DATABASE, PRIORITY_LISTENER, PRIORITY_SERVICES,
};
pub use core_services::{CoreServices, DATABASE_RETRY, STORAGE_RETRY};
