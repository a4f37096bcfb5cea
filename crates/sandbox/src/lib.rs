#![deny(unused)]
//! Sandbox lifecycle engine.
//!
//! This crate gives callers writable, copy-on-write views of a subtree of a
//! project. Each sandbox reserves a scope, gets an overlay from a driver, and
//! moves through a fixed status graph. The repository is the source of truth;
//! drivers are told what to do and the store records what happened.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  SandboxManager (lifecycle)            │
//! │    ↓ reserve scope in a transaction    │
//! ├────────────────────────────────────────┤
//! │  ReservationCoordinator                │
//! │    ↓ overlap check against holders     │
//! ├────────────────────────────────────────┤
//! │  DriverRegistry → OverlayDriver        │
//! │    prepare / activate / deactivate /   │
//! │    destroy / stat                      │
//! ├────────────────────────────────────────┤
//! │  Host overlay                          │
//! │    lower = scope (read-only)           │
//! │    upper, work, merged per sandbox     │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use workspace_sandbox_engine::{DriverRegistry, ManagerOptions, OverlayFsDriver, SandboxManager};
//!
//! let drivers = Arc::new(DriverRegistry::new());
//! drivers.register(Arc::new(OverlayFsDriver::new("/var/lib/sandboxes")));
//! let manager = SandboxManager::new(repo, drivers, ManagerOptions::new("overlayfs"));
//!
//! let sandbox = manager.create(&ctx, &CreateRequest::new("/repo", "/repo/src", "alice")).await?;
//! let sandbox = manager.stop(&ctx, &sandbox.id, sandbox.version).await?;
//! ```

pub mod driver;
pub mod lifecycle;
pub mod overlayfs;
pub mod reconcile;
pub mod registry;
pub mod reservation;

pub use driver::{DriverCapabilities, DriverOp, MockDriver, OverlayDriver};
pub use lifecycle::{ManagerOptions, SandboxManager};
pub use overlayfs::OverlayFsDriver;
pub use reconcile::Reconciler;
pub use registry::DriverRegistry;
pub use reservation::{ReservationCoordinator, ScopeRequest};
