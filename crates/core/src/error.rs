//! Error types for the workspace sandbox manager.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{PathConflict, SandboxId, SandboxStatus};

/// Result type alias using the sandbox manager's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an overlay driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("driver unavailable: {0}")]
    Unavailable(String),

    #[error("insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("overlay already active")]
    AlreadyActive,

    #[error("overlay not active")]
    NotActive,

    #[error("statistics not available: {0}")]
    NotAvailable(String),
}

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Core error type for the sandbox manager.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Scope {scope_path} is outside project root {project_root}")]
    ScopeOutsideProject {
        scope_path: String,
        project_root: String,
    },

    #[error("Scope conflicts with {} existing sandbox(es)", .conflicts.len())]
    PathConflict { conflicts: Vec<PathConflict> },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: SandboxStatus,
        to: SandboxStatus,
        current_version: u64,
    },

    #[error("Concurrent modification: current version is {current_version}")]
    ConcurrentModification { current_version: u64 },

    #[error("Idempotency key {key} already used by sandbox {existing_id} with different parameters")]
    IdempotencyConflict { key: String, existing_id: SandboxId },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sandbox {id} is already deleted")]
    AlreadyDeleted { id: SandboxId, current_version: u64 },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // =========================================================================
    // Driver / Consistency Errors
    // =========================================================================
    #[error("Driver failure for sandbox {sandbox_id}: {source}")]
    DriverFailure {
        sandbox_id: SandboxId,
        #[source]
        source: DriverError,
        current_version: Option<u64>,
    },

    #[error("Store inconsistent for sandbox {sandbox_id}: {detail}")]
    StoreInconsistent { sandbox_id: SandboxId, detail: String },

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stable, machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ScopeOutsideProject,
    PathConflict,
    InvalidTransition,
    ConcurrentModification,
    IdempotencyConflict,
    NotFound,
    AlreadyDeleted,
    Unsupported,
    DriverFailure,
    StoreInconsistent,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ScopeOutsideProject => "scope_outside_project",
            ErrorKind::PathConflict => "path_conflict",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::ConcurrentModification => "concurrent_modification",
            ErrorKind::IdempotencyConflict => "idempotency_conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyDeleted => "already_deleted",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::DriverFailure => "driver_failure",
            ErrorKind::StoreInconsistent => "store_inconsistent",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap a driver error for the given sandbox.
    pub fn driver(sandbox_id: &SandboxId, source: DriverError, current_version: Option<u64>) -> Self {
        Self::DriverFailure {
            sandbox_id: sandbox_id.clone(),
            source,
            current_version,
        }
    }

    /// Stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Serialization(_) => ErrorKind::Validation,
            Error::ScopeOutsideProject { .. } => ErrorKind::ScopeOutsideProject,
            Error::PathConflict { .. } => ErrorKind::PathConflict,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Error::IdempotencyConflict { .. } | Error::UniqueViolation(_) => {
                ErrorKind::IdempotencyConflict
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyDeleted { .. } => ErrorKind::AlreadyDeleted,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::DriverFailure { .. } => ErrorKind::DriverFailure,
            Error::StoreInconsistent { .. } => ErrorKind::StoreInconsistent,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Storage(_) | Error::Config(_) | Error::Internal(_) | Error::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Server-side version of the affected sandbox, when the error carries one.
    pub fn current_version(&self) -> Option<u64> {
        match self {
            Error::InvalidTransition {
                current_version, ..
            }
            | Error::ConcurrentModification { current_version }
            | Error::AlreadyDeleted {
                current_version, ..
            } => Some(*current_version),
            Error::DriverFailure {
                current_version, ..
            } => *current_version,
            _ => None,
        }
    }

    /// Whether the error was raised before any mutation, because of the request itself.
    pub fn is_request_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation
                | ErrorKind::ScopeOutsideProject
                | ErrorKind::PathConflict
                | ErrorKind::InvalidTransition
                | ErrorKind::ConcurrentModification
                | ErrorKind::IdempotencyConflict
                | ErrorKind::AlreadyDeleted
                | ErrorKind::Unsupported
        )
    }
}
