use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use super::request::CreateRequest;
use crate::{Error, Result};

// =============================================================================
// Identity & Attribution
// =============================================================================

/// Unique identifier for a sandbox.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(pub String);

impl SandboxId {
    /// Allocate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SandboxId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of principal that owns a sandbox or triggers an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    #[default]
    User,
    Agent,
    System,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::User => "user",
            OwnerType::Agent => "agent",
            OwnerType::System => "system",
        }
    }
}

impl FromStr for OwnerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(OwnerType::User),
            "agent" => Ok(OwnerType::Agent),
            "system" => Ok(OwnerType::System),
            other => Err(Error::validation(format!("unknown owner type: {}", other))),
        }
    }
}

impl std::fmt::Display for OwnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Status & Transition Graph
// =============================================================================

/// Lifecycle status of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Active,
    Stopped,
    Error,
    Approved,
    Rejected,
    Deleted,
}

impl SandboxStatus {
    pub const ALL: [SandboxStatus; 7] = [
        SandboxStatus::Creating,
        SandboxStatus::Active,
        SandboxStatus::Stopped,
        SandboxStatus::Error,
        SandboxStatus::Approved,
        SandboxStatus::Rejected,
        SandboxStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Active => "active",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
            SandboxStatus::Approved => "approved",
            SandboxStatus::Rejected => "rejected",
            SandboxStatus::Deleted => "deleted",
        }
    }

    /// Only `deleted` is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxStatus::Deleted)
    }

    /// Statuses whose scope blocks overlapping scopes in the same project.
    pub fn holds_reservation(&self) -> bool {
        matches!(self, SandboxStatus::Creating | SandboxStatus::Active)
    }

    /// Statuses reachable in one step.
    pub fn allowed_transitions(&self) -> &'static [SandboxStatus] {
        use SandboxStatus::*;
        match self {
            Creating => &[Active, Error],
            Active => &[Stopped, Error, Approved, Rejected, Deleted],
            Stopped => &[Active, Approved, Rejected, Deleted],
            Error => &[Stopped, Approved, Rejected, Deleted],
            Approved => &[Deleted],
            Rejected => &[Deleted],
            Deleted => &[],
        }
    }

    pub fn can_transition_to(&self, to: SandboxStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl FromStr for SandboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SandboxStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown sandbox status: {}", s)))
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Driver-facing Values
// =============================================================================

/// Directories produced by a driver's `prepare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayDirs {
    pub lower: String,
    pub upper: String,
    pub work: String,
    pub merged: String,
}

/// Best-effort runtime statistics reported by a driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxTelemetry {
    pub size_bytes: u64,
    pub file_count: u64,
    pub active_pids: Vec<u32>,
}

// =============================================================================
// Sandbox Record
// =============================================================================

/// The central sandbox record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: SandboxId,
    pub scope_path: String,
    pub reserved_path: String,
    pub project_root: String,
    /// Comparison form of `project_root`, folded like `reserved_path`.
    pub reserved_root: String,
    pub owner: String,
    pub owner_type: OwnerType,
    pub status: SandboxStatus,
    pub error_message: Option<String>,
    pub driver: String,
    pub driver_version: String,
    pub lower_dir: Option<String>,
    pub upper_dir: Option<String>,
    pub work_dir: Option<String>,
    pub merged_dir: Option<String>,
    pub size_bytes: u64,
    pub file_count: u64,
    pub active_pids: Vec<u32>,
    pub session_count: u32,
    pub tags: BTreeSet<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub version: u64,
    pub base_commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Sandbox {
    /// Build a fresh `creating` record from an already-normalized request.
    pub fn creating(
        id: SandboxId,
        request: &CreateRequest,
        reserved_path: String,
        driver: &str,
        driver_version: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            scope_path: request.scope_path.clone(),
            reserved_path,
            project_root: request.project_root.clone(),
            reserved_root: request.project_root.clone(),
            owner: request.owner.clone(),
            owner_type: request.owner_type,
            status: SandboxStatus::Creating,
            error_message: None,
            driver: driver.to_string(),
            driver_version: driver_version.to_string(),
            lower_dir: None,
            upper_dir: None,
            work_dir: None,
            merged_dir: None,
            size_bytes: 0,
            file_count: 0,
            active_pids: Vec::new(),
            session_count: 0,
            tags: request.tags.clone(),
            metadata: request.metadata.clone(),
            idempotency_key: request.idempotency_key.clone(),
            version: 1,
            base_commit_hash: request.base_commit_hash.clone(),
            created_at: now,
            last_used_at: None,
            stopped_at: None,
            approved_at: None,
            deleted_at: None,
            updated_at: now,
        }
    }

    /// Override the root used for overlap checks, for case-folded services.
    pub fn with_reserved_root(mut self, reserved_root: impl Into<String>) -> Self {
        self.reserved_root = reserved_root.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn holds_reservation(&self) -> bool {
        self.status.holds_reservation()
    }

    /// Check that moving to `to` is legal without mutating anything.
    pub fn check_transition(&self, to: SandboxStatus) -> Result<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.status,
                to,
                current_version: self.version,
            })
        }
    }

    /// Apply a status change, keeping the status timestamps paired with their status.
    pub fn transition_to(&mut self, to: SandboxStatus, now: DateTime<Utc>) -> Result<()> {
        self.check_transition(to)?;
        self.status = to;
        self.stopped_at = (to == SandboxStatus::Stopped).then_some(now);
        self.approved_at = (to == SandboxStatus::Approved).then_some(now);
        self.deleted_at = (to == SandboxStatus::Deleted).then_some(now);
        if to != SandboxStatus::Error {
            self.error_message = None;
        }
        Ok(())
    }

    /// Move to `error` with a message.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(SandboxStatus::Error, now)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn set_dirs(&mut self, dirs: &OverlayDirs) {
        self.lower_dir = Some(dirs.lower.clone());
        self.upper_dir = Some(dirs.upper.clone());
        self.work_dir = Some(dirs.work.clone());
        self.merged_dir = Some(dirs.merged.clone());
    }

    /// Driver directories, if the sandbox was ever prepared.
    pub fn dirs(&self) -> Option<OverlayDirs> {
        Some(OverlayDirs {
            lower: self.lower_dir.clone()?,
            upper: self.upper_dir.clone()?,
            work: self.work_dir.clone()?,
            merged: self.merged_dir.clone()?,
        })
    }

    /// True when `telemetry` would change nothing but `last_used_at`.
    pub fn telemetry_matches(&self, telemetry: &SandboxTelemetry) -> bool {
        self.size_bytes == telemetry.size_bytes
            && self.file_count == telemetry.file_count
            && self.active_pids == telemetry.active_pids
    }

    pub fn apply_telemetry(&mut self, telemetry: &SandboxTelemetry, now: DateTime<Utc>) {
        self.size_bytes = telemetry.size_bytes;
        self.file_count = telemetry.file_count;
        self.active_pids = telemetry.active_pids.clone();
        self.last_used_at = Some(now);
    }
}

// =============================================================================
// Path Conflicts
// =============================================================================

/// Relationship between a candidate scope and an existing reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Exact,
    AncestorOfExisting,
    DescendantOfExisting,
    SiblingNoConflict,
}

impl ConflictType {
    /// Only siblings may coexist with a reservation.
    pub fn is_admissible(&self) -> bool {
        matches!(self, ConflictType::SiblingNoConflict)
    }
}

/// A detected overlap between a requested scope and an existing sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConflict {
    pub existing_id: SandboxId,
    pub existing_scope: String,
    pub new_scope: String,
    pub conflict_type: ConflictType,
}

// =============================================================================
// Aggregates
// =============================================================================

/// Aggregate counters over the store.
///
/// Size figures cover every sandbox that is not `deleted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStats {
    pub creating: u64,
    pub active: u64,
    pub stopped: u64,
    pub error: u64,
    pub approved: u64,
    pub rejected: u64,
    pub deleted: u64,
    pub total_size_bytes: u64,
    pub avg_size_bytes: f64,
}

impl SandboxStats {
    /// Fold in a group of `count` sandboxes sharing `status`.
    pub fn add(&mut self, status: SandboxStatus, count: u64, size_bytes: u64) {
        let slot = match status {
            SandboxStatus::Creating => &mut self.creating,
            SandboxStatus::Active => &mut self.active,
            SandboxStatus::Stopped => &mut self.stopped,
            SandboxStatus::Error => &mut self.error,
            SandboxStatus::Approved => &mut self.approved,
            SandboxStatus::Rejected => &mut self.rejected,
            SandboxStatus::Deleted => &mut self.deleted,
        };
        *slot += count;
        if !status.is_terminal() {
            self.total_size_bytes += size_bytes;
        }
    }

    /// Compute the derived average once every group has been added.
    pub fn finalize(mut self) -> Self {
        let live = self.total() - self.deleted;
        self.avg_size_bytes = if live == 0 {
            0.0
        } else {
            self.total_size_bytes as f64 / live as f64
        };
        self
    }

    pub fn count(&self, status: SandboxStatus) -> u64 {
        match status {
            SandboxStatus::Creating => self.creating,
            SandboxStatus::Active => self.active,
            SandboxStatus::Stopped => self.stopped,
            SandboxStatus::Error => self.error,
            SandboxStatus::Approved => self.approved,
            SandboxStatus::Rejected => self.rejected,
            SandboxStatus::Deleted => self.deleted,
        }
    }

    pub fn total(&self) -> u64 {
        SandboxStatus::ALL.iter().map(|s| self.count(*s)).sum()
    }
}
