//! Scope reservation.
//!
//! A reservation is granted only inside a repository transaction: the
//! overlap read locks what it observes, so two creators racing on
//! overlapping scopes serialize and the second sees the first.

use workspace_sandbox_core::{
    path, Error, PathAlgebra, PathConflict, Result, Sandbox, SandboxId, SandboxTransaction,
};

/// A normalized, containment-checked scope request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRequest {
    pub project_root: String,
    pub scope_path: String,
    /// Comparison form of `project_root`.
    pub reserved_root: String,
    /// Comparison form of `scope_path` (case-folded when paths are case-insensitive).
    pub reserved_path: String,
}

impl ScopeRequest {
    /// Same project and scope once case folding is applied.
    pub fn same_scope(&self, sandbox: &Sandbox) -> bool {
        sandbox.reserved_root == self.reserved_root && sandbox.reserved_path == self.reserved_path
    }
}

/// Grants or denies scopes against the reservations currently held.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReservationCoordinator {
    paths: PathAlgebra,
}

impl ReservationCoordinator {
    pub fn new(paths: PathAlgebra) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> PathAlgebra {
        self.paths
    }

    /// Normalize both paths and require the scope to lie under the root.
    pub fn scope(&self, project_root: &str, scope_path: &str) -> Result<ScopeRequest> {
        let project_root = self.paths.normalize(project_root)?;
        let scope_path = self.paths.normalize(scope_path)?;
        if !self.paths.is_within(&project_root, &scope_path) {
            return Err(Error::ScopeOutsideProject {
                scope_path,
                project_root,
            });
        }
        Ok(ScopeRequest {
            reserved_root: self.paths.reserved_form(&project_root),
            reserved_path: self.paths.reserved_form(&scope_path),
            project_root,
            scope_path,
        })
    }

    /// The scope a stored sandbox reserves.
    pub fn scope_of(&self, sandbox: &Sandbox) -> ScopeRequest {
        ScopeRequest {
            project_root: sandbox.project_root.clone(),
            scope_path: sandbox.scope_path.clone(),
            reserved_root: sandbox.reserved_root.clone(),
            reserved_path: sandbox.reserved_path.clone(),
        }
    }

    /// Locking overlap check; fails with `PathConflict` on any inadmissible overlap.
    pub async fn reserve(
        &self,
        tx: &mut dyn SandboxTransaction,
        request: &ScopeRequest,
        exclude_id: Option<&SandboxId>,
    ) -> Result<()> {
        let holders = tx
            .check_scope_overlap(&request.reserved_path, &request.reserved_root, exclude_id)
            .await?;
        let conflicts = self.conflicts(&holders, request);
        if conflicts.is_empty() {
            Ok(())
        } else {
            tracing::debug!(
                scope = %request.scope_path,
                conflicts = conflicts.len(),
                "Scope reservation denied"
            );
            Err(Error::PathConflict { conflicts })
        }
    }

    /// Classify `request` against each holder, keeping the inadmissible ones.
    pub fn conflicts(&self, holders: &[Sandbox], request: &ScopeRequest) -> Vec<PathConflict> {
        holders
            .iter()
            .filter(|h| h.holds_reservation() && h.reserved_root == request.reserved_root)
            .filter_map(|h| {
                // Reserved paths are already folded, so exact comparison applies.
                let conflict_type = path::classify(&h.reserved_path, &request.reserved_path);
                (!conflict_type.is_admissible()).then(|| PathConflict {
                    existing_id: h.id.clone(),
                    existing_scope: h.scope_path.clone(),
                    new_scope: request.scope_path.clone(),
                    conflict_type,
                })
            })
            .collect()
    }
}
