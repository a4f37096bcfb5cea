use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::sandbox::{OwnerType, Sandbox, SandboxId};
use crate::{Error, Result};

/// Kind of lifecycle event recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Created,
    Activated,
    ActivationFailed,
    Stopped,
    Resumed,
    Approved,
    Rejected,
    Deleted,
    /// A driver call failed outside of activation.
    DriverFailed,
    /// A requested transition could not be completed; no status change.
    TransitionFailed,
    /// The request was refused before any mutation.
    RejectedRequest,
    StoreInconsistent,
    OrphanReclaimed,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 13] = [
        AuditEventType::Created,
        AuditEventType::Activated,
        AuditEventType::ActivationFailed,
        AuditEventType::Stopped,
        AuditEventType::Resumed,
        AuditEventType::Approved,
        AuditEventType::Rejected,
        AuditEventType::Deleted,
        AuditEventType::DriverFailed,
        AuditEventType::TransitionFailed,
        AuditEventType::RejectedRequest,
        AuditEventType::StoreInconsistent,
        AuditEventType::OrphanReclaimed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Created => "created",
            AuditEventType::Activated => "activated",
            AuditEventType::ActivationFailed => "activation_failed",
            AuditEventType::Stopped => "stopped",
            AuditEventType::Resumed => "resumed",
            AuditEventType::Approved => "approved",
            AuditEventType::Rejected => "rejected",
            AuditEventType::Deleted => "deleted",
            AuditEventType::DriverFailed => "driver_failed",
            AuditEventType::TransitionFailed => "transition_failed",
            AuditEventType::RejectedRequest => "rejected_request",
            AuditEventType::StoreInconsistent => "store_inconsistent",
            AuditEventType::OrphanReclaimed => "orphan_reclaimed",
        }
    }

    /// Whether events of this type accompany a status change.
    pub fn is_transition(&self) -> bool {
        !matches!(
            self,
            AuditEventType::TransitionFailed
                | AuditEventType::RejectedRequest
                | AuditEventType::StoreInconsistent
        )
    }
}

impl FromStr for AuditEventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AuditEventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown audit event type: {}", s)))
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Insertion order, assigned by the store.
    pub sequence: u64,
    pub sandbox_id: Option<SandboxId>,
    pub event_type: AuditEventType,
    pub actor: String,
    pub actor_type: OwnerType,
    pub details: serde_json::Map<String, serde_json::Value>,
    /// Snapshot of the sandbox after the event, when one exists.
    pub sandbox_state: Option<Sandbox>,
    pub timestamp: DateTime<Utc>,
}

/// Filter for querying the audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub sandbox_id: Option<SandboxId>,
    pub event_type: Option<AuditEventType>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_sandbox(id: &SandboxId) -> Self {
        Self {
            sandbox_id: Some(id.clone()),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.sandbox_id
            .as_ref()
            .map_or(true, |id| event.sandbox_id.as_ref() == Some(id))
            && self.event_type.map_or(true, |t| event.event_type == t)
    }
}
