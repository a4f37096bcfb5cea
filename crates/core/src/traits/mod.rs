//! Core traits for the sandbox manager.
//!
//! - `repository`: persistence contract (SandboxRepository, SandboxTransaction)

pub mod repository;

pub use repository::*;
