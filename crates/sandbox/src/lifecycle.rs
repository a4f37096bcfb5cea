//! Sandbox lifecycle engine.
//!
//! `SandboxManager` is the only component that mutates sandbox state. Every
//! operation follows the same shape: validate against the stored record,
//! call the driver, then publish the new state with a version-checked write
//! and an audit event. Driver failures move the sandbox to `error` before
//! they surface; store failures after a driver mutation trigger a realigning
//! driver call, and if that fails too the sandbox is flagged inconsistent.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use workspace_sandbox_core::{
    config::SandboxConfig, AuditEvent, AuditEventType, AuditFilter, CallContext, CreateRequest,
    DriverError, DriverResult, Error, ListFilter, OverlayDirs, PathAlgebra, Result, Sandbox,
    SandboxId, SandboxPage, SandboxRepository, SandboxStats, SandboxStatus, MAX_LIST_LIMIT,
};
use workspace_sandbox_governance::{
    track_driver_failure, track_operation, track_rejection, track_transition, Auditor,
};

use crate::driver::{DriverOp, OverlayDriver};
use crate::registry::DriverRegistry;
use crate::reservation::ReservationCoordinator;

// =============================================================================
// Options
// =============================================================================

/// Behavioural switches for the manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Driver used for new sandboxes.
    pub default_driver: String,
    /// Allow `stopped -> active`.
    pub allow_resume: bool,
    pub paths: PathAlgebra,
}

impl ManagerOptions {
    pub fn new(default_driver: impl Into<String>) -> Self {
        Self {
            default_driver: default_driver.into(),
            allow_resume: true,
            paths: PathAlgebra::default(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            default_driver: config.default_driver.clone(),
            allow_resume: config.allow_resume,
            paths: config.path_algebra(),
        }
    }

    pub fn with_resume(mut self, allow: bool) -> Self {
        self.allow_resume = allow;
        self
    }

    pub fn with_paths(mut self, paths: PathAlgebra) -> Self {
        self.paths = paths;
        self
    }
}

enum Reservation {
    Replayed(Sandbox),
    Reserved(Sandbox),
}

// =============================================================================
// Manager
// =============================================================================

/// Orchestrates sandbox lifecycles over a repository and a set of drivers.
pub struct SandboxManager {
    repo: Arc<dyn SandboxRepository>,
    drivers: Arc<DriverRegistry>,
    coordinator: ReservationCoordinator,
    auditor: Auditor,
    options: ManagerOptions,
}

impl SandboxManager {
    pub fn new(
        repo: Arc<dyn SandboxRepository>,
        drivers: Arc<DriverRegistry>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            auditor: Auditor::new(repo.clone()),
            coordinator: ReservationCoordinator::new(options.paths),
            repo,
            drivers,
            options,
        }
    }

    pub fn repository(&self) -> &Arc<dyn SandboxRepository> {
        &self.repo
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    /// Reserve a scope, prepare and mount its overlay, and publish it `active`.
    ///
    /// A repeated idempotency key with the same scope and owner returns the
    /// existing sandbox unchanged.
    pub async fn create(&self, ctx: &CallContext, request: &CreateRequest) -> Result<Sandbox> {
        timed("create", async {
            let driver = self.drivers.resolve(&self.options.default_driver, None)?;
            let created = match self.reserve_new(ctx, request, driver.as_ref()).await {
                Ok(Reservation::Replayed(existing)) => return Ok(existing),
                Ok(Reservation::Reserved(created)) => created,
                Err(e) => return Err(self.refuse(ctx, "create", None, e).await),
            };

            // Abandoned here, the row stays `creating` until reconciliation reclaims it.
            ctx.ensure_active()?;
            self.activate_new(ctx, &driver, created).await
        })
        .await
    }

    async fn reserve_new(
        &self,
        ctx: &CallContext,
        request: &CreateRequest,
        driver: &dyn OverlayDriver,
    ) -> Result<Reservation> {
        ctx.ensure_active()?;
        request.validate()?;
        let scope = self
            .coordinator
            .scope(&request.project_root, &request.scope_path)?;

        let mut tx = self.repo.begin_tx().await?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = tx.find_by_idempotency_key(key).await? {
                if scope.same_scope(&existing) && existing.owner == request.owner {
                    tx.commit().await?;
                    tracing::info!(
                        sandbox_id = %existing.id,
                        idempotency_key = %key,
                        status = %existing.status,
                        "Create replayed from idempotency key"
                    );
                    return Ok(Reservation::Replayed(existing));
                }
                tx.rollback().await?;
                return Err(Error::IdempotencyConflict {
                    key: key.clone(),
                    existing_id: existing.id,
                });
            }
        }

        self.coordinator.reserve(tx.as_mut(), &scope, None).await?;

        let normalized = CreateRequest {
            project_root: scope.project_root.clone(),
            scope_path: scope.scope_path.clone(),
            ..request.clone()
        };
        let record = Sandbox::creating(
            SandboxId::generate(),
            &normalized,
            scope.reserved_path,
            driver.name(),
            driver.version(),
            Utc::now(),
        )
        .with_reserved_root(scope.reserved_root);
        let created = tx.create(&record).await?;
        let event = self.auditor.event(ctx, AuditEventType::Created, &created);
        self.auditor.record_in(tx.as_mut(), event).await?;
        tx.commit().await?;

        tracing::info!(
            sandbox_id = %created.id,
            project_root = %created.project_root,
            scope = %created.scope_path,
            driver = %created.driver,
            "Sandbox scope reserved"
        );
        Ok(Reservation::Reserved(created))
    }

    async fn activate_new(
        &self,
        ctx: &CallContext,
        driver: &Arc<dyn OverlayDriver>,
        created: Sandbox,
    ) -> Result<Sandbox> {
        let dirs = match driver
            .prepare(&created.id, &created.scope_path, &created.project_root)
            .await
        {
            Ok(dirs) => dirs,
            Err(e) => {
                return Err(self
                    .activation_failed(ctx, driver, &created, DriverOp::Prepare, e, None)
                    .await)
            }
        };

        if let Err(e) = tolerate(
            driver.activate(&created.id, &dirs).await,
            DriverError::AlreadyActive,
        ) {
            return Err(self
                .activation_failed(ctx, driver, &created, DriverOp::Activate, e, Some(dirs))
                .await);
        }

        let mut next = created.clone();
        next.set_dirs(&dirs);
        next.transition_to(SandboxStatus::Active, Utc::now())?;
        match self
            .publish(ctx, &created, next, AuditEventType::Activated, Map::new())
            .await
        {
            Ok(active) => Ok(active),
            Err(store_err) => Err(self
                .compensate(ctx, driver, &created, Some(dirs), "activate", store_err)
                .await),
        }
    }

    async fn activation_failed(
        &self,
        ctx: &CallContext,
        driver: &Arc<dyn OverlayDriver>,
        created: &Sandbox,
        op: DriverOp,
        err: DriverError,
        dirs: Option<OverlayDirs>,
    ) -> Error {
        let failure = self
            .record_driver_failure(
                ctx,
                driver.name(),
                created,
                op,
                err,
                AuditEventType::ActivationFailed,
            )
            .await;
        if let Err(e) = driver.destroy(&created.id, dirs.as_ref()).await {
            tracing::warn!(
                sandbox_id = %created.id,
                error = %e,
                "Cleanup after failed activation did not complete"
            );
        }
        failure
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn get(&self, ctx: &CallContext, id: &SandboxId) -> Result<Sandbox> {
        ctx.ensure_active()?;
        self.load(id).await
    }

    pub async fn list(&self, ctx: &CallContext, filter: &ListFilter) -> Result<SandboxPage> {
        ctx.ensure_active()?;
        if let Err(e) = filter.validate() {
            return Err(self.refuse(ctx, "list", None, e).await);
        }
        self.repo.list(filter).await
    }

    pub async fn stats(&self, ctx: &CallContext) -> Result<SandboxStats> {
        ctx.ensure_active()?;
        self.repo.get_stats().await
    }

    /// Audit events for one sandbox, oldest first.
    pub async fn audit_trail(&self, ctx: &CallContext, id: &SandboxId) -> Result<Vec<AuditEvent>> {
        ctx.ensure_active()?;
        self.auditor.trail(&AuditFilter::for_sandbox(id)).await
    }

    pub async fn audit_events(
        &self,
        ctx: &CallContext,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditEvent>> {
        ctx.ensure_active()?;
        self.auditor.trail(filter).await
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Unmount the overlay, keeping its contents.
    pub async fn stop(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
        expected_version: u64,
    ) -> Result<Sandbox> {
        timed("stop", async {
            let current = self
                .checked(ctx, "stop", id, expected_version, SandboxStatus::Stopped)
                .await?;

            let mut mutated = None;
            if let Some(dirs) = current.dirs() {
                let driver = match self.driver_for(&current) {
                    Ok(driver) => driver,
                    Err(e) => {
                        return Err(self
                            .record_driver_failure(
                                ctx,
                                &current.driver,
                                &current,
                                DriverOp::Deactivate,
                                e,
                                AuditEventType::DriverFailed,
                            )
                            .await)
                    }
                };
                match driver.deactivate(&current.id, &dirs).await {
                    Ok(()) => mutated = Some(driver),
                    Err(DriverError::NotActive) => {}
                    Err(e) => {
                        return Err(self
                            .record_driver_failure(
                                ctx,
                                driver.name(),
                                &current,
                                DriverOp::Deactivate,
                                e,
                                AuditEventType::DriverFailed,
                            )
                            .await)
                    }
                }
            }

            let mut next = current.clone();
            next.transition_to(SandboxStatus::Stopped, Utc::now())?;
            match self
                .publish(ctx, &current, next, AuditEventType::Stopped, Map::new())
                .await
            {
                Ok(stopped) => Ok(stopped),
                Err(e) => match mutated {
                    Some(driver) => Err(self
                        .compensate(ctx, &driver, &current, None, "stop", e)
                        .await),
                    None => Err(self.refuse(ctx, "stop", Some(id), e).await),
                },
            }
        })
        .await
    }

    /// Re-mount a stopped sandbox.
    ///
    /// The scope is reserved again (other sandboxes may have claimed an
    /// overlapping scope meanwhile) and `active` is published before mounting;
    /// a failed mount moves the sandbox to `error`.
    pub async fn resume(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
        expected_version: u64,
    ) -> Result<Sandbox> {
        timed("resume", async {
            let (published, driver) = match self.reserve_resume(ctx, id, expected_version).await
            {
                Ok(granted) => granted,
                Err(e) => return Err(self.refuse(ctx, "resume", Some(id), e).await),
            };

            let activation = match published.dirs() {
                Some(dirs) => tolerate(
                    driver.activate(&published.id, &dirs).await,
                    DriverError::AlreadyActive,
                ),
                None => Err(DriverError::Backend(format!(
                    "no overlay directories recorded for {}",
                    published.id
                ))),
            };
            match activation {
                Ok(()) => Ok(published),
                Err(e) => Err(self
                    .record_driver_failure(
                        ctx,
                        driver.name(),
                        &published,
                        DriverOp::Activate,
                        e,
                        AuditEventType::ActivationFailed,
                    )
                    .await),
            }
        })
        .await
    }

    async fn reserve_resume(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
        expected_version: u64,
    ) -> Result<(Sandbox, Arc<dyn OverlayDriver>)> {
        let current = self
            .precheck(ctx, id, expected_version, SandboxStatus::Active)
            .await?;
        if !self.options.allow_resume {
            return Err(Error::Unsupported(
                "resume is disabled by configuration".into(),
            ));
        }
        let driver = self
            .driver_for(&current)
            .map_err(|e| Error::driver(&current.id, e, Some(current.version)))?;
        if !driver.capabilities().resumable {
            return Err(Error::Unsupported(format!(
                "driver '{}' cannot resume sandboxes",
                driver.name()
            )));
        }

        let mut tx = self.repo.begin_tx().await?;
        self.coordinator
            .reserve(tx.as_mut(), &self.coordinator.scope_of(&current), Some(&current.id))
            .await?;
        let mut next = current.clone();
        next.transition_to(SandboxStatus::Active, Utc::now())?;
        let published = tx.update_with_version_check(&next, current.version).await?;
        let mut event = self.auditor.event(ctx, AuditEventType::Resumed, &published);
        event.details = details([("from", json!(current.status.as_str()))]);
        self.auditor.record_in(tx.as_mut(), event).await?;
        tx.commit().await?;

        track_transition(current.status, published.status);
        tracing::info!(
            sandbox_id = %published.id,
            from = %current.status,
            to = %published.status,
            version = published.version,
            "Sandbox transitioned"
        );
        Ok((published, driver))
    }

    /// Mark the sandbox's changes as accepted. No driver call.
    pub async fn approve(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
        expected_version: u64,
    ) -> Result<Sandbox> {
        timed(
            "approve",
            self.review(
                ctx,
                "approve",
                id,
                expected_version,
                SandboxStatus::Approved,
                AuditEventType::Approved,
            ),
        )
        .await
    }

    /// Mark the sandbox's changes as declined. No driver call.
    pub async fn reject(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
        expected_version: u64,
    ) -> Result<Sandbox> {
        timed(
            "reject",
            self.review(
                ctx,
                "reject",
                id,
                expected_version,
                SandboxStatus::Rejected,
                AuditEventType::Rejected,
            ),
        )
        .await
    }

    async fn review(
        &self,
        ctx: &CallContext,
        op: &'static str,
        id: &SandboxId,
        expected_version: u64,
        to: SandboxStatus,
        event_type: AuditEventType,
    ) -> Result<Sandbox> {
        let current = self.checked(ctx, op, id, expected_version, to).await?;
        let mut next = current.clone();
        next.transition_to(to, Utc::now())?;
        match self
            .publish(ctx, &current, next, event_type, Map::new())
            .await
        {
            Ok(reviewed) => Ok(reviewed),
            Err(e) => Err(self.refuse(ctx, op, Some(id), e).await),
        }
    }

    /// Destroy the overlay and soft-delete the record.
    pub async fn delete(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
        expected_version: u64,
    ) -> Result<Sandbox> {
        timed("delete", async {
            let current = self
                .checked(ctx, "delete", id, expected_version, SandboxStatus::Deleted)
                .await?;

            let driver = match self.driver_for(&current) {
                Ok(driver) => driver,
                Err(e) => {
                    return Err(self
                        .record_driver_failure(
                            ctx,
                            &current.driver,
                            &current,
                            DriverOp::Destroy,
                            e,
                            AuditEventType::DriverFailed,
                        )
                        .await)
                }
            };
            if let Err(e) = driver.destroy(&current.id, current.dirs().as_ref()).await {
                return Err(self
                    .record_driver_failure(
                        ctx,
                        driver.name(),
                        &current,
                        DriverOp::Destroy,
                        e,
                        AuditEventType::DriverFailed,
                    )
                    .await);
            }

            let mut next = current.clone();
            next.transition_to(SandboxStatus::Deleted, Utc::now())?;
            match self
                .publish(ctx, &current, next, AuditEventType::Deleted, Map::new())
                .await
            {
                Ok(deleted) => Ok(deleted),
                Err(e) => Err(self
                    .compensate(ctx, &driver, &current, None, "delete", e)
                    .await),
            }
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Telemetry
    // -------------------------------------------------------------------------

    /// Pull usage figures from the driver into the record.
    ///
    /// Returns `None` when nothing was written: the sandbox has no overlay,
    /// the driver cannot report, the figures are unchanged, or the write
    /// lost a race. Failures are logged, never surfaced.
    pub async fn refresh_telemetry(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
    ) -> Result<Option<Sandbox>> {
        ctx.ensure_active()?;
        let current = self.load(id).await?;
        Ok(self.refresh_one(&current).await)
    }

    /// Refresh every sandbox that still has overlay directories. Returns the
    /// number of records updated.
    pub async fn refresh_all_telemetry(&self, ctx: &CallContext) -> Result<usize> {
        let mut refreshed = 0;
        let mut offset = 0;
        loop {
            ctx.ensure_active()?;
            let filter = ListFilter::default()
                .with_status(SandboxStatus::Active)
                .with_status(SandboxStatus::Stopped)
                .with_status(SandboxStatus::Error)
                .with_page(MAX_LIST_LIMIT as i64, offset as i64);
            let page = self.repo.list(&filter).await?;
            let fetched = page.items.len();
            for sandbox in &page.items {
                if self.refresh_one(sandbox).await.is_some() {
                    refreshed += 1;
                }
            }
            offset += fetched;
            if fetched == 0 || offset as u64 >= page.total_count {
                break;
            }
        }
        tracing::debug!(refreshed, "Telemetry sweep finished");
        Ok(refreshed)
    }

    async fn refresh_one(&self, current: &Sandbox) -> Option<Sandbox> {
        if current.is_terminal() {
            return None;
        }
        let dirs = current.dirs()?;
        let driver = self.driver_for(current).ok()?;
        if !driver.capabilities().telemetry {
            return None;
        }

        let telemetry = match driver.stat(&current.id, &dirs).await {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(sandbox_id = %current.id, error = %e, "Telemetry unavailable");
                return None;
            }
        };

        // Unchanged figures are not written, so holders of `version` keep it.
        if current.telemetry_matches(&telemetry) {
            return None;
        }
        let mut next = current.clone();
        next.apply_telemetry(&telemetry, Utc::now());
        match self
            .repo
            .update_with_version_check(&next, current.version)
            .await
        {
            Ok(updated) => Some(updated),
            Err(e) => {
                tracing::debug!(
                    sandbox_id = %current.id,
                    error = %e,
                    "Telemetry write skipped"
                );
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Move a sandbox stuck in `creating` to `error` and drop its artifacts.
    ///
    /// The store write goes first so a creator that finishes concurrently
    /// wins and the reclaim fails with `ConcurrentModification`.
    pub async fn reclaim_orphan(
        &self,
        ctx: &CallContext,
        orphan: &Sandbox,
        reason: &str,
    ) -> Result<Sandbox> {
        let mut next = orphan.clone();
        next.fail(reason, Utc::now())?;
        let reclaimed = self
            .publish(
                ctx,
                orphan,
                next,
                AuditEventType::OrphanReclaimed,
                details([("reason", json!(reason))]),
            )
            .await?;

        match self.driver_for(&reclaimed) {
            Ok(driver) => {
                if let Err(e) = driver.destroy(&reclaimed.id, reclaimed.dirs().as_ref()).await {
                    tracing::warn!(
                        sandbox_id = %reclaimed.id,
                        error = %e,
                        "Could not remove artifacts of reclaimed sandbox"
                    );
                }
            }
            Err(e) => tracing::warn!(sandbox_id = %reclaimed.id, error = %e, "Driver missing"),
        }
        Ok(reclaimed)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn load(&self, id: &SandboxId) -> Result<Sandbox> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("sandbox {}", id)))
    }

    fn driver_for(&self, sandbox: &Sandbox) -> DriverResult<Arc<dyn OverlayDriver>> {
        let driver = self.drivers.get(&sandbox.driver).ok_or_else(|| {
            DriverError::Unavailable(format!("driver '{}' is not registered", sandbox.driver))
        })?;
        if driver.version() != sandbox.driver_version {
            tracing::debug!(
                sandbox_id = %sandbox.id,
                recorded = %sandbox.driver_version,
                running = %driver.version(),
                "Driver version differs from the one that created the sandbox"
            );
        }
        Ok(driver)
    }

    /// Version first, then legality of the move.
    async fn precheck(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
        expected_version: u64,
        to: SandboxStatus,
    ) -> Result<Sandbox> {
        ctx.ensure_active()?;
        let current = self.load(id).await?;
        if to == SandboxStatus::Deleted && current.is_terminal() {
            return Err(Error::AlreadyDeleted {
                id: current.id,
                current_version: current.version,
            });
        }
        if current.version != expected_version {
            return Err(Error::ConcurrentModification {
                current_version: current.version,
            });
        }
        current.check_transition(to)?;
        Ok(current)
    }

    async fn checked(
        &self,
        ctx: &CallContext,
        op: &'static str,
        id: &SandboxId,
        expected_version: u64,
        to: SandboxStatus,
    ) -> Result<Sandbox> {
        match self.precheck(ctx, id, expected_version, to).await {
            Ok(current) => Ok(current),
            Err(e) => Err(self.refuse(ctx, op, Some(id), e).await),
        }
    }

    /// Count and audit a refused request, then hand the error back.
    async fn refuse(
        &self,
        ctx: &CallContext,
        op: &'static str,
        sandbox_id: Option<&SandboxId>,
        err: Error,
    ) -> Error {
        if err.is_request_rejection() {
            track_rejection(err.kind());
            tracing::info!(
                op,
                sandbox_id = ?sandbox_id.map(|id| id.as_str()),
                kind = %err.kind(),
                error = %err,
                "Request rejected"
            );
            let event = self.auditor.rejection(ctx, op, sandbox_id, &err);
            self.auditor.record_best_effort(event).await;
        }
        err
    }

    /// Publish a status change: the write and its audit event commit together.
    async fn publish(
        &self,
        ctx: &CallContext,
        current: &Sandbox,
        next: Sandbox,
        event_type: AuditEventType,
        mut details: Map<String, Value>,
    ) -> Result<Sandbox> {
        details.insert("from".into(), json!(current.status.as_str()));
        let stored = self
            .write_with_event(ctx, current, &next, event_type, details)
            .await?;
        track_transition(current.status, stored.status);
        tracing::info!(
            sandbox_id = %stored.id,
            from = %current.status,
            to = %stored.status,
            version = stored.version,
            "Sandbox transitioned"
        );
        Ok(stored)
    }

    /// Version-checked write of `next` and one audit event in a single
    /// transaction. Nothing is stored unless both succeed.
    async fn write_with_event(
        &self,
        ctx: &CallContext,
        current: &Sandbox,
        next: &Sandbox,
        event_type: AuditEventType,
        details: Map<String, Value>,
    ) -> Result<Sandbox> {
        let mut tx = self.repo.begin_tx().await?;
        let stored = tx.update_with_version_check(next, current.version).await?;
        let mut event = self.auditor.event(ctx, event_type, &stored);
        event.details = details;
        self.auditor.record_in(tx.as_mut(), event).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// Move to `error` after a driver failure, where the graph allows it.
    async fn record_driver_failure(
        &self,
        ctx: &CallContext,
        driver_name: &str,
        current: &Sandbox,
        op: DriverOp,
        err: DriverError,
        event_type: AuditEventType,
    ) -> Error {
        track_driver_failure(driver_name, op.as_str());
        tracing::warn!(
            sandbox_id = %current.id,
            driver = %driver_name,
            op = %op,
            error = %err,
            "Driver operation failed"
        );

        let failure = details([
            ("operation", json!(op.as_str())),
            ("driver", json!(driver_name)),
            ("driver_error", json!(err.to_string())),
        ]);

        let mut failed = current.clone();
        if failed
            .fail(format!("{} failed: {}", op, err), Utc::now())
            .is_ok()
        {
            return match self
                .publish(ctx, current, failed, event_type, failure)
                .await
            {
                Ok(stored) => Error::driver(&current.id, err, Some(stored.version)),
                Err(store_err) => {
                    tracing::error!(
                        sandbox_id = %current.id,
                        error = %store_err,
                        "Could not record driver failure on sandbox"
                    );
                    let version = store_err.current_version().or(Some(current.version));
                    Error::driver(&current.id, err, version)
                }
            };
        }

        // No edge to `error` from here; record the failure without a status change.
        let mut event = self
            .auditor
            .event(ctx, AuditEventType::TransitionFailed, current);
        event.details = failure;
        self.auditor.record_best_effort(event).await;
        Error::driver(&current.id, err, Some(current.version))
    }

    /// The driver changed state but the store did not follow.
    ///
    /// Re-reads the record and drives the overlay back in line with whatever
    /// the store now says. If that fails as well, the sandbox is flagged and
    /// `StoreInconsistent` is returned.
    async fn compensate(
        &self,
        ctx: &CallContext,
        driver: &Arc<dyn OverlayDriver>,
        previous: &Sandbox,
        dirs: Option<OverlayDirs>,
        op: &'static str,
        store_err: Error,
    ) -> Error {
        let target = match self.repo.get(&previous.id).await {
            Ok(Some(stored)) => stored,
            _ => previous.clone(),
        };
        let dirs = target.dirs().or_else(|| previous.dirs()).or(dirs);

        let reversal_err = match align_driver(driver.as_ref(), &target, dirs.as_ref()).await {
            Ok(()) => {
                tracing::warn!(
                    sandbox_id = %previous.id,
                    op,
                    status = %target.status,
                    error = %store_err,
                    "Store update failed after driver call; overlay realigned with stored state"
                );
                let mut event = self
                    .auditor
                    .event(ctx, AuditEventType::TransitionFailed, &target);
                event.details = details([
                    ("operation", json!(op)),
                    ("error_kind", json!(store_err.kind().as_str())),
                    ("message", json!(store_err.to_string())),
                ]);
                self.auditor.record_best_effort(event).await;
                return store_err;
            }
            Err(e) => e,
        };

        let detail = format!(
            "{} applied by driver '{}' but the store update failed ({}); reversal failed ({})",
            op,
            driver.name(),
            store_err,
            reversal_err
        );
        tracing::error!(sandbox_id = %previous.id, op, %detail, "Sandbox store inconsistent");

        let inconsistency = details([
            ("operation", json!(op)),
            ("store_error", json!(store_err.to_string())),
            ("reversal_error", json!(reversal_err.to_string())),
        ]);
        let mut flagged = target.clone();
        let flaggable = if flagged.status == SandboxStatus::Error {
            flagged.error_message = Some(detail.clone());
            true
        } else {
            flagged.fail(detail.clone(), Utc::now()).is_ok()
        };
        let written = if flaggable {
            self.write_with_event(
                ctx,
                &target,
                &flagged,
                AuditEventType::StoreInconsistent,
                inconsistency.clone(),
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    sandbox_id = %previous.id,
                    error = %e,
                    "Could not flag sandbox as inconsistent"
                )
            })
            .ok()
        } else {
            None
        };
        match written {
            Some(stored) if stored.status != target.status => {
                track_transition(target.status, stored.status)
            }
            Some(_) => {}
            None => {
                let mut event = self
                    .auditor
                    .event(ctx, AuditEventType::StoreInconsistent, &target);
                event.details = inconsistency;
                self.auditor.record_best_effort(event).await;
            }
        }

        Error::StoreInconsistent {
            sandbox_id: previous.id.clone(),
            detail,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn timed<T>(op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    let started = Instant::now();
    let result = fut.await;
    track_operation(op, started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::debug!(op, kind = %e.kind(), error = %e, "Sandbox operation failed");
    }
    result
}

fn tolerate(result: DriverResult<()>, benign: DriverError) -> DriverResult<()> {
    match result {
        Err(e) if e == benign => Ok(()),
        other => other,
    }
}

fn details<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Bring the overlay to the state `target.status` implies.
async fn align_driver(
    driver: &dyn OverlayDriver,
    target: &Sandbox,
    dirs: Option<&OverlayDirs>,
) -> DriverResult<()> {
    let id = &target.id;
    match (target.status, dirs) {
        (SandboxStatus::Creating | SandboxStatus::Deleted, dirs) => driver.destroy(id, dirs).await,
        (SandboxStatus::Active, Some(dirs)) => tolerate(
            driver.activate(id, dirs).await,
            DriverError::AlreadyActive,
        ),
        (SandboxStatus::Active, None) => Err(DriverError::Backend(format!(
            "no overlay directories recorded for {}",
            id
        ))),
        (_, Some(dirs)) => tolerate(driver.deactivate(id, dirs).await, DriverError::NotActive),
        (_, None) => Ok(()),
    }
}
