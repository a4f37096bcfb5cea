//! Overlay driver contract.
//!
//! This module provides the `OverlayDriver` trait and `MockDriver`, an
//! in-process implementation with injectable failures for deterministic
//! lifecycle tests. The kernel overlayfs driver lives in `overlayfs`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use workspace_sandbox_core::{DriverError, DriverResult, OverlayDirs, SandboxId, SandboxTelemetry};

// =============================================================================
// Driver Trait
// =============================================================================

/// What a driver can do beyond the mandatory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    /// `activate` may be called again after `deactivate`.
    pub resumable: bool,
    /// `stat` returns real figures.
    pub telemetry: bool,
    /// Operations need elevated privileges on the host.
    pub requires_privilege: bool,
}

/// Driver operation names, used for metrics, logs and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverOp {
    Prepare,
    Activate,
    Deactivate,
    Destroy,
    Stat,
}

impl DriverOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverOp::Prepare => "prepare",
            DriverOp::Activate => "activate",
            DriverOp::Deactivate => "deactivate",
            DriverOp::Destroy => "destroy",
            DriverOp::Stat => "stat",
        }
    }
}

impl std::fmt::Display for DriverOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A copy-on-write overlay backend.
///
/// Implementations must be re-entrant across distinct sandboxes. Calls
/// against one sandbox may be serialized internally.
#[async_trait]
pub trait OverlayDriver: Send + Sync {
    /// Registry name, recorded on every sandbox the driver produces.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn capabilities(&self) -> DriverCapabilities;

    /// Create the per-sandbox directories. `lower` is the scope itself.
    async fn prepare(
        &self,
        id: &SandboxId,
        scope_path: &str,
        project_root: &str,
    ) -> DriverResult<OverlayDirs>;

    /// Mount the overlay so writes become visible at `merged`.
    ///
    /// Returns `AlreadyActive` when mounted; callers may treat that as success.
    async fn activate(&self, id: &SandboxId, dirs: &OverlayDirs) -> DriverResult<()>;

    /// Unmount, keeping upper/work for inspection.
    ///
    /// Returns `NotActive` when not mounted; callers may treat that as success.
    async fn deactivate(&self, id: &SandboxId, dirs: &OverlayDirs) -> DriverResult<()>;

    /// Remove upper/work/merged. Never touches `lower`.
    ///
    /// `dirs` is `None` when the sandbox was never prepared.
    async fn destroy(&self, id: &SandboxId, dirs: Option<&OverlayDirs>) -> DriverResult<()>;

    /// Best-effort usage figures; may lag.
    async fn stat(&self, id: &SandboxId, dirs: &OverlayDirs) -> DriverResult<SandboxTelemetry>;

    /// Check if the backend can be used on this host.
    async fn is_available(&self) -> bool;
}

// =============================================================================
// Mock Driver (for testing)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockOverlay {
    Prepared,
    Active,
    Inactive,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    error: DriverError,
    once: bool,
}

/// In-process driver that only keeps bookkeeping.
pub struct MockDriver {
    name: String,
    version: String,
    capabilities: DriverCapabilities,
    overlays: DashMap<SandboxId, MockOverlay>,
    failures: DashMap<DriverOp, InjectedFailure>,
    calls: DashMap<DriverOp, u64>,
    telemetry: DashMap<SandboxId, SandboxTelemetry>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            name: "mock".into(),
            version: "1.0.0".into(),
            capabilities: DriverCapabilities {
                resumable: true,
                telemetry: true,
                requires_privilege: false,
            },
            overlays: DashMap::new(),
            failures: DashMap::new(),
            calls: DashMap::new(),
            telemetry: DashMap::new(),
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.name = name.into();
        self.version = version.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: DriverCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fail every call to `op` until cleared.
    pub fn fail_on(&self, op: DriverOp, error: DriverError) {
        self.failures.insert(op, InjectedFailure { error, once: false });
    }

    /// Fail only the next call to `op`.
    pub fn fail_once(&self, op: DriverOp, error: DriverError) {
        self.failures.insert(op, InjectedFailure { error, once: true });
    }

    pub fn clear_failure(&self, op: DriverOp) {
        self.failures.remove(&op);
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: DriverOp) -> u64 {
        self.calls.get(&op).map(|c| *c.value()).unwrap_or(0)
    }

    pub fn is_active(&self, id: &SandboxId) -> bool {
        self.overlays
            .get(id)
            .map(|o| *o.value() == MockOverlay::Active)
            .unwrap_or(false)
    }

    /// Whether artifacts for `id` exist (prepared and not destroyed).
    pub fn has_artifacts(&self, id: &SandboxId) -> bool {
        self.overlays.contains_key(id)
    }

    pub fn set_telemetry(&self, id: &SandboxId, telemetry: SandboxTelemetry) {
        self.telemetry.insert(id.clone(), telemetry);
    }

    fn enter(&self, op: DriverOp) -> DriverResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        let injected = self.failures.get(&op).map(|f| f.value().clone());
        match injected {
            Some(failure) => {
                if failure.once {
                    self.failures.remove(&op);
                }
                Err(failure.error)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OverlayDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    async fn prepare(
        &self,
        id: &SandboxId,
        scope_path: &str,
        _project_root: &str,
    ) -> DriverResult<OverlayDirs> {
        self.enter(DriverOp::Prepare)?;
        self.overlays.insert(id.clone(), MockOverlay::Prepared);
        let base = format!("/mock/{}", id);
        Ok(OverlayDirs {
            lower: scope_path.to_string(),
            upper: format!("{}/upper", base),
            work: format!("{}/work", base),
            merged: format!("{}/merged", base),
        })
    }

    async fn activate(&self, id: &SandboxId, _dirs: &OverlayDirs) -> DriverResult<()> {
        self.enter(DriverOp::Activate)?;
        let mut overlay = self
            .overlays
            .get_mut(id)
            .ok_or_else(|| DriverError::Backend(format!("sandbox {} was not prepared", id)))?;
        if *overlay == MockOverlay::Active {
            return Err(DriverError::AlreadyActive);
        }
        *overlay = MockOverlay::Active;
        Ok(())
    }

    async fn deactivate(&self, id: &SandboxId, _dirs: &OverlayDirs) -> DriverResult<()> {
        self.enter(DriverOp::Deactivate)?;
        match self.overlays.get_mut(id) {
            Some(mut overlay) if *overlay == MockOverlay::Active => {
                *overlay = MockOverlay::Inactive;
                Ok(())
            }
            _ => Err(DriverError::NotActive),
        }
    }

    async fn destroy(&self, id: &SandboxId, _dirs: Option<&OverlayDirs>) -> DriverResult<()> {
        self.enter(DriverOp::Destroy)?;
        self.overlays.remove(id);
        self.telemetry.remove(id);
        Ok(())
    }

    async fn stat(&self, id: &SandboxId, _dirs: &OverlayDirs) -> DriverResult<SandboxTelemetry> {
        self.enter(DriverOp::Stat)?;
        if !self.overlays.contains_key(id) {
            return Err(DriverError::NotAvailable(format!("no overlay for {}", id)));
        }
        Ok(self
            .telemetry
            .get(id)
            .map(|t| t.value().clone())
            .unwrap_or_default())
    }

    async fn is_available(&self) -> bool {
        true
    }
}
