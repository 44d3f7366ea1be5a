//! keel - idempotent, dependency-ordered infrastructure lifecycle runs.
//!
//! The binary lives in `main.rs`; these modules are shared with the
//! integration tests.

pub mod cli;
pub mod setup;
