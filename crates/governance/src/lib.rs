#![deny(unused)]
//! Governance for the workspace sandbox manager.
//!
//! This crate provides:
//! - Audit recording (`Auditor`) on top of the repository's append-only log
//! - Distributed tracing setup
//! - Prometheus metrics for lifecycle transitions and failures

pub mod audit;
pub mod metrics;
pub mod tracing_layer;

pub use audit::Auditor;
pub use metrics::{
    setup_metrics_recorder, track_driver_failure, track_operation, track_rejection,
    track_transition,
};
pub use tracing_layer::configure_tracing;
