#![deny(unused)]
//! Sandbox repositories.
//!
//! Two implementations of `SandboxRepository`:
//! - `InMemorySandboxRepository`: a mutex-guarded map, for tests and ephemeral runs.
//! - `SqliteSandboxRepository`: durable storage on SQLite via `rusqlite`.
//!
//! Both keep the same contract: the store assigns timestamps and versions,
//! version-checked writes fail with `ConcurrentModification`, idempotency keys
//! are unique among live rows, and the audit log is append-only.

pub mod memory;
pub mod sqlite;

use workspace_sandbox_core::{path, types::Sandbox};

pub use memory::{InMemorySandboxRepository, InMemoryTransaction};
pub use sqlite::{SqliteSandboxRepository, SqliteTransaction};

/// Reserved paths are already in canonical (possibly case-folded) form,
/// so comparison here is exact.
pub(crate) fn scopes_intersect(existing: &str, candidate: &str) -> bool {
    path::is_within(existing, candidate) || path::is_within(candidate, existing)
}

/// Copy the fields an update may change. Identity, scope and attribution stay as stored.
pub(crate) fn copy_mutable_fields(stored: &mut Sandbox, update: &Sandbox) {
    stored.status = update.status;
    stored.error_message = update.error_message.clone();
    stored.driver = update.driver.clone();
    stored.driver_version = update.driver_version.clone();
    stored.lower_dir = update.lower_dir.clone();
    stored.upper_dir = update.upper_dir.clone();
    stored.work_dir = update.work_dir.clone();
    stored.merged_dir = update.merged_dir.clone();
    stored.size_bytes = update.size_bytes;
    stored.file_count = update.file_count;
    stored.active_pids = update.active_pids.clone();
    stored.session_count = update.session_count;
    stored.tags = update.tags.clone();
    stored.metadata = update.metadata.clone();
    stored.last_used_at = update.last_used_at;
    stored.stopped_at = update.stopped_at;
    stored.approved_at = update.approved_at;
    stored.deleted_at = update.deleted_at;
}
