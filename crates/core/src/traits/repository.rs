//! Persistence contract for sandbox records and the audit log.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AuditEvent, AuditFilter, ListFilter, Sandbox, SandboxId, SandboxPage, SandboxStats};

/// Persistent store of sandboxes, audit events and scope reservations.
///
/// Calls on the repository itself auto-commit. `begin_tx` opens a
/// serializable transaction for the reservation path.
#[async_trait]
pub trait SandboxRepository: Send + Sync {
    /// Insert a new record. The store assigns `created_at`, `updated_at` and `version = 1`.
    ///
    /// Fails with `UniqueViolation` when a non-terminal sandbox already holds the idempotency key.
    async fn create(&self, sandbox: &Sandbox) -> Result<Sandbox>;

    /// Fetch a record; `None` when absent.
    async fn get(&self, id: &SandboxId) -> Result<Option<Sandbox>>;

    /// Replace mutable fields and bump the version unconditionally.
    async fn update(&self, sandbox: &Sandbox) -> Result<Sandbox>;

    /// Replace mutable fields only if the stored version equals `expected_version`.
    async fn update_with_version_check(
        &self,
        sandbox: &Sandbox,
        expected_version: u64,
    ) -> Result<Sandbox>;

    /// Soft-delete: move to `deleted` and stamp `deleted_at`.
    async fn delete(&self, id: &SandboxId) -> Result<Sandbox>;

    /// Paginated query with defensive bounds.
    async fn list(&self, filter: &ListFilter) -> Result<SandboxPage>;

    /// Reservation holders under `reserved_root` whose reserved path is equal
    /// to, above, or below `reserved_path`. Both arguments are in comparison form.
    async fn check_scope_overlap(
        &self,
        reserved_path: &str,
        reserved_root: &str,
        exclude_id: Option<&SandboxId>,
    ) -> Result<Vec<Sandbox>>;

    /// Look up a non-terminal sandbox by idempotency key.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Sandbox>>;

    /// Append an audit event; returns it with its sequence number.
    async fn log_audit_event(&self, event: &AuditEvent) -> Result<AuditEvent>;

    /// Read audit events in insertion order.
    async fn list_audit_events(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>>;

    /// Counts per status plus size aggregates.
    async fn get_stats(&self) -> Result<SandboxStats>;

    /// Start a serializable transaction.
    async fn begin_tx(&self) -> Result<Box<dyn SandboxTransaction>>;
}

/// A serializable transaction over the reservation path.
///
/// Reads inside a transaction lock what they observe, so a concurrent
/// creator cannot act on a stale negative. Aggregate and list queries are
/// deliberately absent. Dropping without `commit` rolls back.
#[async_trait]
pub trait SandboxTransaction: Send {
    async fn check_scope_overlap(
        &mut self,
        reserved_path: &str,
        reserved_root: &str,
        exclude_id: Option<&SandboxId>,
    ) -> Result<Vec<Sandbox>>;

    async fn find_by_idempotency_key(&mut self, key: &str) -> Result<Option<Sandbox>>;

    async fn create(&mut self, sandbox: &Sandbox) -> Result<Sandbox>;

    async fn update_with_version_check(
        &mut self,
        sandbox: &Sandbox,
        expected_version: u64,
    ) -> Result<Sandbox>;

    async fn log_audit_event(&mut self, event: &AuditEvent) -> Result<AuditEvent>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
