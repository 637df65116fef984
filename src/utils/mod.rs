//! Pure utility functions.
//!
//! Process bootstrap and poller pacing helpers used across the crate.

pub mod bootstrap;
pub mod retry;
