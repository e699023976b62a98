//! Shared helpers for binaries and components.

pub mod bootstrap;
pub mod retry;
