//! Core type definitions for the sandbox manager.
//!
//! Broken down into submodules: the sandbox record and its status graph,
//! audit events, and request/filter shapes.

pub mod audit;
pub mod request;
pub mod sandbox;

pub use audit::*;
pub use request::*;
pub use sandbox::*;
