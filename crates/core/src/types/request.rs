use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

use super::sandbox::{OwnerType, Sandbox, SandboxStatus};
use crate::{Error, Result};

/// Default page size for list queries.
pub const DEFAULT_LIST_LIMIT: usize = 100;
/// Hard cap on the page size for list queries.
pub const MAX_LIST_LIMIT: usize = 10_000;

const MAX_TAGS: usize = 32;
const MAX_TAG_LEN: usize = 64;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

// =============================================================================
// Call Context
// =============================================================================

/// Attribution and cancellation for a single manager call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub actor: String,
    pub actor_type: OwnerType,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(actor: impl Into<String>, actor_type: OwnerType) -> Self {
        Self {
            actor: actor.into(),
            actor_type,
            cancel: CancellationToken::new(),
        }
    }

    /// Context for work the service performs on its own behalf.
    pub fn system() -> Self {
        Self::new("sandbox-manager", OwnerType::System)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fail with `Cancelled` once the caller has given up.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Create
// =============================================================================

/// Request to create a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRequest {
    pub project_root: String,
    pub scope_path: String,
    pub owner: String,
    #[serde(default)]
    pub owner_type: OwnerType,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub base_commit_hash: Option<String>,
}

impl CreateRequest {
    pub fn new(
        project_root: impl Into<String>,
        scope_path: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            scope_path: scope_path.into(),
            owner: owner.into(),
            owner_type: OwnerType::User,
            idempotency_key: None,
            tags: BTreeSet::new(),
            metadata: serde_json::Map::new(),
            base_commit_hash: None,
        }
    }

    pub fn with_owner_type(mut self, owner_type: OwnerType) -> Self {
        self.owner_type = owner_type;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_base_commit(mut self, hash: impl Into<String>) -> Self {
        self.base_commit_hash = Some(hash.into());
        self
    }

    /// Field-level checks that do not involve paths.
    pub fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            return Err(Error::validation("owner must not be empty"));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(Error::validation(format!(
                    "idempotency_key must be 1..={} characters",
                    MAX_IDEMPOTENCY_KEY_LEN
                )));
            }
        }
        if self.tags.len() > MAX_TAGS {
            return Err(Error::validation(format!(
                "at most {} tags are allowed",
                MAX_TAGS
            )));
        }
        if let Some(bad) = self
            .tags
            .iter()
            .find(|t| t.trim().is_empty() || t.len() > MAX_TAG_LEN)
        {
            return Err(Error::validation(format!("invalid tag: {:?}", bad)));
        }
        Ok(())
    }
}

// =============================================================================
// List
// =============================================================================

/// Query options for listing sandboxes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListFilter {
    #[serde(default)]
    pub status: Option<Vec<SandboxStatus>>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub project_root: Option<String>,
    #[serde(default)]
    pub scope_path: Option<String>,
    #[serde(default)]
    pub created_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl ListFilter {
    /// Parse a filter, rejecting unknown fields.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::validation(format!("invalid list filter: {}", e)))
    }

    pub fn with_status(mut self, status: SandboxStatus) -> Self {
        self.status.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn with_project_root(mut self, root: impl Into<String>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    /// Reject out-of-range pagination and inverted time windows.
    pub fn validate(&self) -> Result<()> {
        if matches!(self.limit, Some(l) if l < 0) {
            return Err(Error::validation("limit must not be negative"));
        }
        if matches!(self.offset, Some(o) if o < 0) {
            return Err(Error::validation("offset must not be negative"));
        }
        if let (Some(from), Some(to)) = (self.created_from, self.created_to) {
            if from > to {
                return Err(Error::validation("created_from must not be after created_to"));
            }
        }
        Ok(())
    }

    /// Page size after defensive bounds: unset or zero means the default.
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            Some(l) if l > 0 => (l as usize).min(MAX_LIST_LIMIT),
            _ => DEFAULT_LIST_LIMIT,
        }
    }

    pub fn effective_offset(&self) -> usize {
        self.offset.map_or(0, |o| o.max(0) as usize)
    }

    /// Whether a record satisfies every predicate (pagination aside).
    pub fn matches(&self, sandbox: &Sandbox) -> bool {
        self.status
            .as_ref()
            .map_or(true, |set| set.is_empty() || set.contains(&sandbox.status))
            && self.owner.as_ref().map_or(true, |o| &sandbox.owner == o)
            && self
                .project_root
                .as_ref()
                .map_or(true, |r| &sandbox.project_root == r)
            && self
                .scope_path
                .as_ref()
                .map_or(true, |s| &sandbox.scope_path == s)
            && self.created_from.map_or(true, |t| sandbox.created_at >= t)
            && self.created_to.map_or(true, |t| sandbox.created_at <= t)
    }
}

/// One page of list results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPage {
    pub items: Vec<Sandbox>,
    pub total_count: u64,
    pub limit: usize,
    pub offset: usize,
}
