#![deny(unused)]
//! Core types, traits, and error definitions for the workspace sandbox manager.
//!
//! This crate holds everything the store, driver and lifecycle layers share:
//! the sandbox record and its status graph, the path algebra used for scope
//! reservations, the repository contract, and layered configuration.

pub mod config;
pub mod error;
pub mod path;
pub mod traits;
pub mod types;

pub use error::{DriverError, DriverResult, Error, ErrorKind, Result};
pub use path::PathAlgebra;
pub use traits::*;
pub use types::*;
