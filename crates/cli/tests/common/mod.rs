//! Shared helpers for integration tests

pub mod cli;

pub use cli::{CommandResult, RelocaleCommand};
