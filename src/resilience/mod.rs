//! Resilience helpers for local store I/O.

pub mod retry;
