//! Shared utilities: process bootstrap, retry and counters.

pub mod bootstrap;
pub mod metrics;
pub mod retry;
