//! In-memory sandbox repository.
//!
//! A single async mutex guards all state; a transaction holds the guard
//! for its whole lifetime, which makes transactions serializable against
//! each other and against auto-commit calls.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use workspace_sandbox_core::{
    traits::{SandboxRepository, SandboxTransaction},
    types::{
        AuditEvent, AuditFilter, ListFilter, Sandbox, SandboxId, SandboxPage, SandboxStats,
        SandboxStatus,
    },
    Error, Result,
};

use crate::{copy_mutable_fields, scopes_intersect};

#[derive(Debug, Default)]
struct State {
    sandboxes: HashMap<SandboxId, Sandbox>,
    audit: Vec<AuditEvent>,
}

impl State {
    fn insert(&mut self, sandbox: &Sandbox) -> Result<Sandbox> {
        if self.sandboxes.contains_key(&sandbox.id) {
            return Err(Error::UniqueViolation(format!(
                "sandbox id {} already exists",
                sandbox.id
            )));
        }
        if let Some(key) = &sandbox.idempotency_key {
            if self.find_by_key(key).is_some() {
                return Err(Error::UniqueViolation(format!(
                    "idempotency key {} is held by a live sandbox",
                    key
                )));
            }
        }

        let now = Utc::now();
        let mut stored = sandbox.clone();
        stored.version = 1;
        stored.created_at = now;
        stored.updated_at = now;
        self.sandboxes.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    fn write(&mut self, sandbox: &Sandbox, expected_version: Option<u64>) -> Result<Sandbox> {
        let stored = self
            .sandboxes
            .get_mut(&sandbox.id)
            .ok_or_else(|| Error::not_found(format!("sandbox {}", sandbox.id)))?;

        if let Some(expected) = expected_version {
            if stored.version != expected {
                return Err(Error::ConcurrentModification {
                    current_version: stored.version,
                });
            }
        }

        copy_mutable_fields(stored, sandbox);
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    fn soft_delete(&mut self, id: &SandboxId) -> Result<Sandbox> {
        let stored = self
            .sandboxes
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("sandbox {}", id)))?;
        if stored.is_terminal() {
            return Err(Error::AlreadyDeleted {
                id: id.clone(),
                current_version: stored.version,
            });
        }

        let now = Utc::now();
        stored.transition_to(SandboxStatus::Deleted, now)?;
        stored.version += 1;
        stored.updated_at = now;
        Ok(stored.clone())
    }

    fn overlaps(
        &self,
        reserved_path: &str,
        reserved_root: &str,
        exclude_id: Option<&SandboxId>,
    ) -> Vec<Sandbox> {
        let mut found: Vec<Sandbox> = self
            .sandboxes
            .values()
            .filter(|s| {
                s.holds_reservation()
                    && s.reserved_root == reserved_root
                    && exclude_id.map_or(true, |id| &s.id != id)
                    && scopes_intersect(&s.reserved_path, reserved_path)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        found
    }

    fn find_by_key(&self, key: &str) -> Option<&Sandbox> {
        self.sandboxes
            .values()
            .find(|s| !s.is_terminal() && s.idempotency_key.as_deref() == Some(key))
    }

    fn append_audit(&mut self, event: &AuditEvent) -> AuditEvent {
        let mut stored = event.clone();
        stored.sequence = self.audit.len() as u64 + 1;
        self.audit.push(stored.clone());
        stored
    }
}

/// In-memory repository for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemorySandboxRepository {
    state: Arc<Mutex<State>>,
}

impl InMemorySandboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sandboxes, including soft-deleted ones.
    pub async fn len(&self) -> usize {
        self.state.lock().await.sandboxes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SandboxRepository for InMemorySandboxRepository {
    async fn create(&self, sandbox: &Sandbox) -> Result<Sandbox> {
        self.state.lock().await.insert(sandbox)
    }

    async fn get(&self, id: &SandboxId) -> Result<Option<Sandbox>> {
        Ok(self.state.lock().await.sandboxes.get(id).cloned())
    }

    async fn update(&self, sandbox: &Sandbox) -> Result<Sandbox> {
        self.state.lock().await.write(sandbox, None)
    }

    async fn update_with_version_check(
        &self,
        sandbox: &Sandbox,
        expected_version: u64,
    ) -> Result<Sandbox> {
        self.state
            .lock()
            .await
            .write(sandbox, Some(expected_version))
    }

    async fn delete(&self, id: &SandboxId) -> Result<Sandbox> {
        self.state.lock().await.soft_delete(id)
    }

    async fn list(&self, filter: &ListFilter) -> Result<SandboxPage> {
        let limit = filter.effective_limit();
        let offset = filter.effective_offset();

        let state = self.state.lock().await;
        let mut matched: Vec<&Sandbox> = state
            .sandboxes
            .values()
            .filter(|s| filter.matches(s))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        Ok(SandboxPage {
            total_count: matched.len() as u64,
            items: matched
                .into_iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
            limit,
            offset,
        })
    }

    async fn check_scope_overlap(
        &self,
        reserved_path: &str,
        reserved_root: &str,
        exclude_id: Option<&SandboxId>,
    ) -> Result<Vec<Sandbox>> {
        Ok(self
            .state
            .lock()
            .await
            .overlaps(reserved_path, reserved_root, exclude_id))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Sandbox>> {
        Ok(self.state.lock().await.find_by_key(key).cloned())
    }

    async fn log_audit_event(&self, event: &AuditEvent) -> Result<AuditEvent> {
        Ok(self.state.lock().await.append_audit(event))
    }

    async fn list_audit_events(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_stats(&self) -> Result<SandboxStats> {
        let state = self.state.lock().await;
        let mut stats = SandboxStats::default();
        for sandbox in state.sandboxes.values() {
            stats.add(sandbox.status, 1, sandbox.size_bytes);
        }
        Ok(stats.finalize())
    }

    async fn begin_tx(&self) -> Result<Box<dyn SandboxTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            guard,
            undo: Vec::new(),
            finished: false,
        }))
    }
}

enum Undo {
    Remove(SandboxId),
    Restore(Box<Sandbox>),
    TruncateAudit(usize),
}

/// Transaction holding the repository lock until commit or rollback.
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<State>,
    undo: Vec<Undo>,
    finished: bool,
}

impl InMemoryTransaction {
    fn revert(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Remove(id) => {
                    self.guard.sandboxes.remove(&id);
                }
                Undo::Restore(sandbox) => {
                    self.guard.sandboxes.insert(sandbox.id.clone(), *sandbox);
                }
                Undo::TruncateAudit(len) => self.guard.audit.truncate(len),
            }
        }
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.revert();
        }
    }
}

#[async_trait]
impl SandboxTransaction for InMemoryTransaction {
    async fn check_scope_overlap(
        &mut self,
        reserved_path: &str,
        reserved_root: &str,
        exclude_id: Option<&SandboxId>,
    ) -> Result<Vec<Sandbox>> {
        Ok(self.guard.overlaps(reserved_path, reserved_root, exclude_id))
    }

    async fn find_by_idempotency_key(&mut self, key: &str) -> Result<Option<Sandbox>> {
        Ok(self.guard.find_by_key(key).cloned())
    }

    async fn create(&mut self, sandbox: &Sandbox) -> Result<Sandbox> {
        let stored = self.guard.insert(sandbox)?;
        self.undo.push(Undo::Remove(stored.id.clone()));
        Ok(stored)
    }

    async fn update_with_version_check(
        &mut self,
        sandbox: &Sandbox,
        expected_version: u64,
    ) -> Result<Sandbox> {
        let previous = self.guard.sandboxes.get(&sandbox.id).cloned();
        let stored = self.guard.write(sandbox, Some(expected_version))?;
        if let Some(previous) = previous {
            self.undo.push(Undo::Restore(Box::new(previous)));
        }
        Ok(stored)
    }

    async fn log_audit_event(&mut self, event: &AuditEvent) -> Result<AuditEvent> {
        self.undo.push(Undo::TruncateAudit(self.guard.audit.len()));
        Ok(self.guard.append_audit(event))
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.undo.clear();
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.revert();
        self.finished = true;
        Ok(())
    }
}
