//! Audit recording for sandbox lifecycle events.
//!
//! The audit log itself lives in the repository. `Auditor` builds events
//! with attribution and a post-event snapshot, and writes them either inside
//! an open transaction (so the event commits with the change it describes)
//! or directly against the repository.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use workspace_sandbox_core::{
    AuditEvent, AuditEventType, AuditFilter, CallContext, Error, Result, Sandbox, SandboxId,
    SandboxRepository, SandboxTransaction,
};

/// Append-only recorder of lifecycle events.
#[derive(Clone)]
pub struct Auditor {
    repo: Arc<dyn SandboxRepository>,
}

impl Auditor {
    pub fn new(repo: Arc<dyn SandboxRepository>) -> Self {
        Self { repo }
    }

    /// Event describing `sandbox` as it stands after the change.
    pub fn event(
        &self,
        ctx: &CallContext,
        event_type: AuditEventType,
        sandbox: &Sandbox,
    ) -> AuditEvent {
        AuditEvent {
            sequence: 0,
            sandbox_id: Some(sandbox.id.clone()),
            event_type,
            actor: ctx.actor.clone(),
            actor_type: ctx.actor_type,
            details: Map::new(),
            sandbox_state: Some(sandbox.clone()),
            timestamp: Utc::now(),
        }
    }

    /// Event for a request refused before any mutation.
    pub fn rejection(
        &self,
        ctx: &CallContext,
        operation: &str,
        sandbox_id: Option<&SandboxId>,
        err: &Error,
    ) -> AuditEvent {
        let mut details = Map::new();
        details.insert("operation".into(), json!(operation));
        details.insert("error_kind".into(), json!(err.kind().as_str()));
        details.insert("message".into(), json!(err.to_string()));
        if let Some(version) = err.current_version() {
            details.insert("current_version".into(), json!(version));
        }
        if let Error::PathConflict { conflicts } = err {
            details.insert(
                "conflicts".into(),
                serde_json::to_value(conflicts).unwrap_or(Value::Null),
            );
        }

        AuditEvent {
            sequence: 0,
            sandbox_id: sandbox_id.cloned(),
            event_type: AuditEventType::RejectedRequest,
            actor: ctx.actor.clone(),
            actor_type: ctx.actor_type,
            details,
            sandbox_state: None,
            timestamp: Utc::now(),
        }
    }

    /// Write an event inside an open transaction.
    pub async fn record_in(
        &self,
        tx: &mut dyn SandboxTransaction,
        event: AuditEvent,
    ) -> Result<AuditEvent> {
        let stored = tx.log_audit_event(&event).await?;
        trace_event(&stored);
        Ok(stored)
    }

    /// Write an event directly; failures propagate.
    pub async fn record(&self, event: AuditEvent) -> Result<AuditEvent> {
        let stored = self.repo.log_audit_event(&event).await?;
        trace_event(&stored);
        Ok(stored)
    }

    /// Write an event whose loss must not fail the caller's operation.
    pub async fn record_best_effort(&self, event: AuditEvent) -> Option<AuditEvent> {
        match self.record(event.clone()).await {
            Ok(stored) => Some(stored),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    event_type = %event.event_type,
                    sandbox_id = ?event.sandbox_id,
                    "Failed to persist audit event"
                );
                None
            }
        }
    }

    pub async fn trail(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        self.repo.list_audit_events(filter).await
    }
}

fn trace_event(event: &AuditEvent) {
    let status = event
        .sandbox_state
        .as_ref()
        .map(|s| s.status.as_str())
        .unwrap_or("-");
    tracing::info!(
        target: "audit",
        sequence = event.sequence,
        event_type = %event.event_type,
        sandbox_id = ?event.sandbox_id.as_ref().map(|id| id.as_str()),
        actor = %event.actor,
        actor_type = %event.actor_type,
        status,
        "Audit event recorded"
    );
}
