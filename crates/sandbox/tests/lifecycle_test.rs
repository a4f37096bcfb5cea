//! Lifecycle integration tests.
//!
//! Tests the full pipeline: SandboxManager → ReservationCoordinator →
//! repository → MockDriver. Scenario tests run against both the in-memory
//! store and SQLite; failure-path tests use the in-memory store.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use workspace_sandbox_core::{
    AuditEvent, AuditEventType, AuditFilter, CallContext, ConflictType, CreateRequest,
    DriverError, Error, ListFilter, OwnerType, Sandbox, SandboxId, SandboxPage,
    SandboxRepository, SandboxStats, SandboxStatus, SandboxTelemetry, SandboxTransaction,
};
use workspace_sandbox_engine::{
    DriverCapabilities, DriverOp, DriverRegistry, ManagerOptions, MockDriver, Reconciler,
    SandboxManager,
};
use workspace_sandbox_store::{InMemorySandboxRepository, SqliteSandboxRepository};

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    manager: Arc<SandboxManager>,
    driver: Arc<MockDriver>,
    repo: Arc<dyn SandboxRepository>,
}

fn harness_with(
    repo: Arc<dyn SandboxRepository>,
    driver: MockDriver,
    options: ManagerOptions,
) -> Harness {
    let driver = Arc::new(driver);
    let drivers = Arc::new(DriverRegistry::new());
    drivers.register(driver.clone());
    Harness {
        manager: Arc::new(SandboxManager::new(repo.clone(), drivers, options)),
        driver,
        repo,
    }
}

fn memory_harness() -> Harness {
    harness_with(
        Arc::new(InMemorySandboxRepository::new()),
        MockDriver::new(),
        ManagerOptions::new("mock"),
    )
}

fn alice() -> CallContext {
    CallContext::new("alice", OwnerType::User)
}

fn request(scope: &str) -> CreateRequest {
    CreateRequest::new("/p", scope, "alice")
}

async fn event_types(h: &Harness, id: &SandboxId) -> Vec<AuditEventType> {
    h.manager
        .audit_trail(&alice(), id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

async fn rejections(h: &Harness) -> Vec<AuditEvent> {
    let filter = AuditFilter {
        event_type: Some(AuditEventType::RejectedRequest),
        ..Default::default()
    };
    h.manager.audit_events(&alice(), &filter).await.unwrap()
}

// =============================================================================
// 1. Scenarios (both backends)
// =============================================================================

async fn happy_path(h: Harness) {
    let sandbox = h.manager.create(&alice(), &request("/p/src")).await.unwrap();

    assert_eq!(sandbox.status, SandboxStatus::Active);
    assert_eq!(sandbox.version, 2);
    assert_eq!(sandbox.owner, "alice");
    assert!(sandbox.merged_dir.is_some());
    assert!(h.driver.is_active(&sandbox.id));
    assert_eq!(
        event_types(&h, &sandbox.id).await,
        vec![AuditEventType::Created, AuditEventType::Activated]
    );
}

async fn exact_conflict(h: Harness) {
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();

    let bob = CallContext::new("bob", OwnerType::User);
    let err = h
        .manager
        .create(&bob, &CreateRequest::new("/p", "/p/src", "bob"))
        .await
        .unwrap_err();
    match err {
        Error::PathConflict { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].conflict_type, ConflictType::Exact);
            assert_eq!(conflicts[0].existing_id, x.id);
        }
        other => panic!("expected PathConflict, got {other:?}"),
    }

    let unchanged = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(unchanged, x);
    assert_eq!(rejections(&h).await.len(), 1);
}

async fn ancestor_conflict(h: Harness) {
    h.manager.create(&alice(), &request("/p/src")).await.unwrap();

    let err = h.manager.create(&alice(), &request("/p")).await.unwrap_err();
    match err {
        Error::PathConflict { conflicts } => {
            assert_eq!(conflicts[0].conflict_type, ConflictType::AncestorOfExisting)
        }
        other => panic!("expected PathConflict, got {other:?}"),
    }
}

async fn sibling_allowed(h: Harness) {
    let src = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let docs = h.manager.create(&alice(), &request("/p/docs")).await.unwrap();

    assert_ne!(src.id, docs.id);
    assert_eq!(docs.status, SandboxStatus::Active);
}

async fn idempotent_replay(h: Harness) {
    let keyed = request("/p/src").with_idempotency_key("k1");
    let first = h.manager.create(&alice(), &keyed).await.unwrap();
    let second = h.manager.create(&alice(), &keyed).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.version, first.version);
    assert_eq!(h.driver.calls(DriverOp::Prepare), 1);

    let err = h
        .manager
        .create(&alice(), &request("/p/other").with_idempotency_key("k1"))
        .await
        .unwrap_err();
    match err {
        Error::IdempotencyConflict { key, existing_id } => {
            assert_eq!(key, "k1");
            assert_eq!(existing_id, first.id);
        }
        other => panic!("expected IdempotencyConflict, got {other:?}"),
    }
}

async fn optimistic_concurrency(h: Harness) {
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    assert_eq!(x.version, 2);

    let stopped = h.manager.stop(&alice(), &x.id, 2).await.unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert_eq!(stopped.version, 3);
    assert!(stopped.stopped_at.is_some());

    let err = h.manager.stop(&alice(), &x.id, 2).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConcurrentModification { current_version: 3 }
    ));
    let current = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(current.status, SandboxStatus::Stopped);
    assert_eq!(current.version, 3);
}

async fn concurrent_overlapping_creates(h: Harness) {
    let ctx = alice();
    let req_a = request("/p/src");
    let req_b = request("/p/src/lib");
    let (a, b) = tokio::join!(
        h.manager.create(&ctx, &req_a),
        h.manager.create(&ctx, &req_b),
    );

    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1, "exactly one overlapping create may win");
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(Error::PathConflict { .. })));

    let holders = h
        .manager
        .list(&ctx, &ListFilter::default().with_status(SandboxStatus::Active))
        .await
        .unwrap();
    assert_eq!(holders.total_count, 1);
}

async fn full_lifecycle_audit(h: Harness) {
    let ctx = alice();
    let x = h.manager.create(&ctx, &request("/p/src")).await.unwrap();
    let x = h.manager.stop(&ctx, &x.id, x.version).await.unwrap();
    let x = h.manager.resume(&ctx, &x.id, x.version).await.unwrap();
    let x = h.manager.approve(&ctx, &x.id, x.version).await.unwrap();
    assert!(x.approved_at.is_some());
    let x = h.manager.delete(&ctx, &x.id, x.version).await.unwrap();
    assert_eq!(x.status, SandboxStatus::Deleted);
    assert!(x.deleted_at.is_some());
    assert!(x.approved_at.is_none());
    assert!(!h.driver.has_artifacts(&x.id));

    let trail = h.manager.audit_trail(&ctx, &x.id).await.unwrap();
    let expected = [
        (AuditEventType::Created, SandboxStatus::Creating),
        (AuditEventType::Activated, SandboxStatus::Active),
        (AuditEventType::Stopped, SandboxStatus::Stopped),
        (AuditEventType::Resumed, SandboxStatus::Active),
        (AuditEventType::Approved, SandboxStatus::Approved),
        (AuditEventType::Deleted, SandboxStatus::Deleted),
    ];
    assert_eq!(trail.len(), expected.len());
    for (event, (event_type, status)) in trail.iter().zip(expected) {
        assert_eq!(event.event_type, event_type);
        assert_eq!(event.actor, "alice");
        let state = event.sandbox_state.as_ref().unwrap();
        assert_eq!(state.status, status);
    }
    assert!(trail.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

macro_rules! scenario_tests {
    ($($name:ident),* $(,)?) => {
        mod memory_backend {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(memory_harness()).await;
                }
            )*
        }

        mod sqlite_backend {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let dir = tempfile::tempdir().unwrap();
                    let repo = SqliteSandboxRepository::open(dir.path().join("sandboxes.db")).unwrap();
                    super::$name(harness_with(
                        Arc::new(repo),
                        MockDriver::new(),
                        ManagerOptions::new("mock"),
                    ))
                    .await;
                }
            )*
        }
    };
}

scenario_tests!(
    happy_path,
    exact_conflict,
    ancestor_conflict,
    sibling_allowed,
    idempotent_replay,
    optimistic_concurrency,
    concurrent_overlapping_creates,
    full_lifecycle_audit,
);

// =============================================================================
// 2. Validation
// =============================================================================

#[tokio::test]
async fn test_scope_outside_project_is_rejected_and_audited() {
    let h = memory_harness();
    let err = h
        .manager
        .create(&alice(), &CreateRequest::new("/p", "/q/src", "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ScopeOutsideProject { .. }));

    let err = h
        .manager
        .create(&alice(), &CreateRequest::new("/p", "/p/../etc", "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    assert_eq!(h.driver.calls(DriverOp::Prepare), 0);
    let rejected = rejections(&h).await;
    assert_eq!(rejected.len(), 2);
    assert_eq!(rejected[0].details["operation"], "create");
    assert_eq!(rejected[0].details["error_kind"], "scope_outside_project");
}

#[tokio::test]
async fn test_paths_are_normalized_before_storage() {
    let h = memory_harness();
    let sandbox = h
        .manager
        .create(&alice(), &CreateRequest::new("/p/", "/p//src/./", "alice"))
        .await
        .unwrap();
    assert_eq!(sandbox.project_root, "/p");
    assert_eq!(sandbox.scope_path, "/p/src");
    assert_eq!(sandbox.reserved_path, "/p/src");
}

#[tokio::test]
async fn test_invalid_list_filter_is_rejected() {
    let h = memory_harness();
    let err = h
        .manager
        .list(&alice(), &ListFilter::default().with_page(-1, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_get_missing_is_not_found() {
    let h = memory_harness();
    let err = h
        .manager
        .get(&alice(), &SandboxId::from("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(rejections(&h).await.is_empty());
}

#[tokio::test]
async fn test_invalid_transition_leaves_record_untouched() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let x = h.manager.approve(&alice(), &x.id, x.version).await.unwrap();

    let err = h.manager.stop(&alice(), &x.id, x.version).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: SandboxStatus::Approved,
            to: SandboxStatus::Stopped,
            ..
        }
    ));
    assert_eq!(h.manager.get(&alice(), &x.id).await.unwrap(), x);
}

// =============================================================================
// 3. Reservations
// =============================================================================

#[tokio::test]
async fn test_stopped_sandbox_releases_its_scope() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    h.manager.stop(&alice(), &x.id, x.version).await.unwrap();

    let y = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    assert_eq!(y.status, SandboxStatus::Active);
}

#[tokio::test]
async fn test_resume_re_reserves_scope() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let x = h.manager.stop(&alice(), &x.id, x.version).await.unwrap();
    let y = h.manager.create(&alice(), &request("/p/src/lib")).await.unwrap();

    let err = h.manager.resume(&alice(), &x.id, x.version).await.unwrap_err();
    match err {
        Error::PathConflict { conflicts } => {
            assert_eq!(conflicts[0].existing_id, y.id);
            assert_eq!(conflicts[0].conflict_type, ConflictType::AncestorOfExisting);
        }
        other => panic!("expected PathConflict, got {other:?}"),
    }
    let x_now = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(x_now.status, SandboxStatus::Stopped);
    assert!(!h.driver.is_active(&x.id));
}

#[tokio::test]
async fn test_case_insensitive_service_folds_reservations() {
    let h = harness_with(
        Arc::new(InMemorySandboxRepository::new()),
        MockDriver::new(),
        ManagerOptions::new("mock")
            .with_paths(workspace_sandbox_core::PathAlgebra::new(false)),
    );
    let x = h.manager.create(&alice(), &request("/p/Src")).await.unwrap();
    assert_eq!(x.scope_path, "/p/Src");
    assert_eq!(x.reserved_path, "/p/src");

    let err = h.manager.create(&alice(), &request("/p/SRC")).await.unwrap_err();
    assert!(matches!(err, Error::PathConflict { .. }));
}

async fn assert_roots_fold(repo: Arc<dyn SandboxRepository>) {
    let h = harness_with(
        repo,
        MockDriver::new(),
        ManagerOptions::new("mock")
            .with_paths(workspace_sandbox_core::PathAlgebra::new(false)),
    );
    let x = h
        .manager
        .create(
            &alice(),
            &CreateRequest::new("/P", "/P/src", "alice").with_idempotency_key("job-1"),
        )
        .await
        .unwrap();
    assert_eq!(x.project_root, "/P");
    assert_eq!(x.reserved_root, "/p");

    let err = h
        .manager
        .create(&alice(), &CreateRequest::new("/p", "/p/src", "alice"))
        .await
        .unwrap_err();
    match err {
        Error::PathConflict { conflicts } => {
            assert_eq!(conflicts[0].existing_id, x.id);
            assert_eq!(conflicts[0].conflict_type, ConflictType::Exact);
        }
        other => panic!("expected PathConflict, got {other:?}"),
    }

    let replay = h
        .manager
        .create(
            &alice(),
            &CreateRequest::new("/p", "/p/SRC", "alice").with_idempotency_key("job-1"),
        )
        .await
        .unwrap();
    assert_eq!(replay.id, x.id);
    assert_eq!(h.driver.calls(DriverOp::Prepare), 1);
}

#[tokio::test]
async fn test_case_insensitive_service_folds_project_roots_memory() {
    assert_roots_fold(Arc::new(InMemorySandboxRepository::new())).await;
}

#[tokio::test]
async fn test_case_insensitive_service_folds_project_roots_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let repo = SqliteSandboxRepository::open(dir.path().join("sandboxes.db")).unwrap();
    assert_roots_fold(Arc::new(repo)).await;
}

// =============================================================================
// 4. Driver failures
// =============================================================================

#[tokio::test]
async fn test_prepare_failure_moves_to_error_and_releases_scope() {
    let h = memory_harness();
    h.driver
        .fail_once(DriverOp::Prepare, DriverError::Unavailable("no overlay".into()));

    let err = h.manager.create(&alice(), &request("/p/src")).await.unwrap_err();
    let Error::DriverFailure {
        sandbox_id,
        source,
        current_version,
    } = err
    else {
        panic!("expected DriverFailure");
    };
    assert!(matches!(source, DriverError::Unavailable(_)));
    assert_eq!(current_version, Some(2));

    let failed = h.manager.get(&alice(), &sandbox_id).await.unwrap();
    assert_eq!(failed.status, SandboxStatus::Error);
    assert!(failed.error_message.unwrap().contains("prepare failed"));
    assert_eq!(
        event_types(&h, &sandbox_id).await,
        vec![AuditEventType::Created, AuditEventType::ActivationFailed]
    );

    // `error` no longer holds the reservation.
    let retry = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    assert_eq!(retry.status, SandboxStatus::Active);
}

#[tokio::test]
async fn test_activate_failure_cleans_up_artifacts() {
    let h = memory_harness();
    h.driver.fail_once(
        DriverOp::Activate,
        DriverError::InsufficientPrivilege("mount".into()),
    );

    let err = h.manager.create(&alice(), &request("/p/src")).await.unwrap_err();
    let Error::DriverFailure { sandbox_id, .. } = err else {
        panic!("expected DriverFailure");
    };
    assert!(!h.driver.has_artifacts(&sandbox_id));
    assert_eq!(h.driver.calls(DriverOp::Destroy), 1);
    let failed = h.manager.get(&alice(), &sandbox_id).await.unwrap();
    assert_eq!(failed.status, SandboxStatus::Error);
}

#[tokio::test]
async fn test_deactivate_failure_moves_to_error() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    h.driver
        .fail_once(DriverOp::Deactivate, DriverError::Backend("busy".into()));

    let err = h.manager.stop(&alice(), &x.id, x.version).await.unwrap_err();
    assert_eq!(err.current_version(), Some(x.version + 1));
    let failed = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(failed.status, SandboxStatus::Error);

    // error -> stopped is allowed once the driver recovers.
    let stopped = h.manager.stop(&alice(), &x.id, failed.version).await.unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert!(stopped.error_message.is_none());
}

#[tokio::test]
async fn test_stop_tolerates_already_inactive_overlay() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let dirs = x.dirs().unwrap();
    use workspace_sandbox_engine::OverlayDriver;
    h.driver.deactivate(&x.id, &dirs).await.unwrap();

    let stopped = h.manager.stop(&alice(), &x.id, x.version).await.unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
}

#[tokio::test]
async fn test_destroy_failure_on_delete() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let x = h.manager.reject(&alice(), &x.id, x.version).await.unwrap();
    h.driver
        .fail_on(DriverOp::Destroy, DriverError::Backend("device busy".into()));

    let err = h.manager.delete(&alice(), &x.id, x.version).await.unwrap_err();
    assert!(matches!(err, Error::DriverFailure { .. }));

    // rejected has no edge to error: status stays, failure is audited.
    let still = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(still.status, SandboxStatus::Rejected);
    assert_eq!(still.version, x.version);
    assert_eq!(
        event_types(&h, &x.id).await.last(),
        Some(&AuditEventType::TransitionFailed)
    );

    h.driver.clear_failure(DriverOp::Destroy);
    let deleted = h.manager.delete(&alice(), &x.id, x.version).await.unwrap();
    assert_eq!(deleted.status, SandboxStatus::Deleted);
}

#[tokio::test]
async fn test_unregistered_default_driver_is_config_error() {
    let h = harness_with(
        Arc::new(InMemorySandboxRepository::new()),
        MockDriver::new(),
        ManagerOptions::new("overlayfs"),
    );
    let err = h.manager.create(&alice(), &request("/p/src")).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(h.repo.list(&ListFilter::default()).await.unwrap().items.is_empty());
}

// =============================================================================
// 5. Delete semantics
// =============================================================================

#[tokio::test]
async fn test_delete_twice_is_already_deleted() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let deleted = h.manager.delete(&alice(), &x.id, x.version).await.unwrap();

    // Checked before the version: a stale version still reports AlreadyDeleted.
    let err = h.manager.delete(&alice(), &x.id, x.version).await.unwrap_err();
    match err {
        Error::AlreadyDeleted {
            id,
            current_version,
        } => {
            assert_eq!(id, x.id);
            assert_eq!(current_version, deleted.version);
        }
        other => panic!("expected AlreadyDeleted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delete_while_creating_is_invalid() {
    let h = memory_harness();
    let req = request("/p/src");
    let orphan = Sandbox::creating(
        SandboxId::from("orphan"),
        &req,
        "/p/src".into(),
        "mock",
        "1.0.0",
        Utc::now(),
    );
    h.repo.create(&orphan).await.unwrap();

    let err = h
        .manager
        .delete(&alice(), &orphan.id, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: SandboxStatus::Creating,
            to: SandboxStatus::Deleted,
            ..
        }
    ));
    assert_eq!(h.driver.calls(DriverOp::Destroy), 0);
}

#[tokio::test]
async fn test_deleted_sandbox_frees_idempotency_key() {
    let h = memory_harness();
    let keyed = request("/p/src").with_idempotency_key("k1");
    let first = h.manager.create(&alice(), &keyed).await.unwrap();
    h.manager
        .delete(&alice(), &first.id, first.version)
        .await
        .unwrap();

    let second = h.manager.create(&alice(), &keyed).await.unwrap();
    assert_ne!(first.id, second.id);
}

// =============================================================================
// 6. Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stops_single_winner() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = h.manager.clone();
        let id = x.id.clone();
        let version = x.version;
        handles.push(tokio::spawn(async move {
            manager.stop(&alice(), &id, version).await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(stopped) => {
                winners += 1;
                assert_eq!(stopped.version, x.version + 1);
            }
            Err(e) => assert!(matches!(e, Error::ConcurrentModification { .. })),
        }
    }
    assert_eq!(winners, 1);

    let current = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(current.status, SandboxStatus::Stopped);
    assert!(!h.driver.is_active(&x.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_overlapping_creates_single_winner() {
    let h = memory_harness();
    let scopes = ["/p/a", "/p/a/b", "/p/a/b/c", "/p", "/p/a/d"];
    let mut handles = Vec::new();
    for scope in scopes {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager.create(&alice(), &request(scope)).await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    // Only a/d is disjoint from a/b and a/b/c, so at most two can hold at once.
    assert!((1..=2).contains(&winners));

    let holders = h
        .repo
        .list(&ListFilter::default().with_status(SandboxStatus::Active))
        .await
        .unwrap()
        .items;
    for (i, a) in holders.iter().enumerate() {
        for b in &holders[i + 1..] {
            assert!(
                !workspace_sandbox_core::path::is_within(&a.reserved_path, &b.reserved_path)
                    && !workspace_sandbox_core::path::is_within(&b.reserved_path, &a.reserved_path),
                "{} and {} overlap",
                a.scope_path,
                b.scope_path
            );
        }
    }
}

// =============================================================================
// 7. Resume gating
// =============================================================================

#[tokio::test]
async fn test_resume_disabled_by_configuration() {
    let h = harness_with(
        Arc::new(InMemorySandboxRepository::new()),
        MockDriver::new(),
        ManagerOptions::new("mock").with_resume(false),
    );
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let x = h.manager.stop(&alice(), &x.id, x.version).await.unwrap();

    let err = h.manager.resume(&alice(), &x.id, x.version).await.unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

#[tokio::test]
async fn test_resume_requires_driver_capability() {
    let h = harness_with(
        Arc::new(InMemorySandboxRepository::new()),
        MockDriver::new().with_capabilities(DriverCapabilities {
            resumable: false,
            telemetry: true,
            requires_privilege: false,
        }),
        ManagerOptions::new("mock"),
    );
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let x = h.manager.stop(&alice(), &x.id, x.version).await.unwrap();

    let err = h.manager.resume(&alice(), &x.id, x.version).await.unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
    assert_eq!(rejections(&h).await.len(), 1);
}

#[tokio::test]
async fn test_resume_activation_failure_moves_to_error() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let x = h.manager.stop(&alice(), &x.id, x.version).await.unwrap();
    h.driver
        .fail_once(DriverOp::Activate, DriverError::Backend("mount failed".into()));

    let err = h.manager.resume(&alice(), &x.id, x.version).await.unwrap_err();
    assert!(matches!(err, Error::DriverFailure { .. }));

    let failed = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(failed.status, SandboxStatus::Error);
    let types = event_types(&h, &x.id).await;
    assert_eq!(
        &types[types.len() - 2..],
        &[AuditEventType::Resumed, AuditEventType::ActivationFailed]
    );
}

// =============================================================================
// 8. Telemetry
// =============================================================================

#[tokio::test]
async fn test_refresh_telemetry_updates_record() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    h.driver.set_telemetry(
        &x.id,
        SandboxTelemetry {
            size_bytes: 4096,
            file_count: 3,
            active_pids: vec![42],
        },
    );

    let refreshed = h
        .manager
        .refresh_telemetry(&alice(), &x.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.size_bytes, 4096);
    assert_eq!(refreshed.file_count, 3);
    assert_eq!(refreshed.active_pids, vec![42]);
    assert!(refreshed.last_used_at.is_some());
    assert_eq!(refreshed.version, x.version + 1);
    assert_eq!(refreshed.status, SandboxStatus::Active);

    let stats = h.manager.stats(&alice()).await.unwrap();
    assert_eq!(stats.total_size_bytes, 4096);
}

#[tokio::test]
async fn test_refresh_telemetry_swallows_driver_failure() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    h.driver
        .fail_once(DriverOp::Stat, DriverError::NotAvailable("busy".into()));

    assert!(h
        .manager
        .refresh_telemetry(&alice(), &x.id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.manager.get(&alice(), &x.id).await.unwrap(), x);
}

#[tokio::test]
async fn test_refresh_all_telemetry_skips_deleted() {
    let h = memory_harness();
    let a = h.manager.create(&alice(), &request("/p/a")).await.unwrap();
    let b = h.manager.create(&alice(), &request("/p/b")).await.unwrap();
    h.manager.stop(&alice(), &b.id, b.version).await.unwrap();
    let c = h.manager.create(&alice(), &request("/p/c")).await.unwrap();
    h.manager.delete(&alice(), &c.id, c.version).await.unwrap();
    for id in [&a.id, &b.id] {
        h.driver.set_telemetry(
            id,
            SandboxTelemetry {
                size_bytes: 512,
                file_count: 1,
                active_pids: vec![],
            },
        );
    }

    let refreshed = h.manager.refresh_all_telemetry(&alice()).await.unwrap();
    assert_eq!(refreshed, 2);
    assert!(h
        .manager
        .get(&alice(), &a.id)
        .await
        .unwrap()
        .last_used_at
        .is_some());
}

#[tokio::test]
async fn test_unchanged_telemetry_keeps_version() {
    let h = memory_harness();
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();

    // Nothing changed on disk since creation: no write, no version bump.
    assert_eq!(h.manager.refresh_all_telemetry(&alice()).await.unwrap(), 0);
    let unchanged = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(unchanged.version, x.version);

    // A client holding the version from create can still act on it.
    h.manager.stop(&alice(), &x.id, x.version).await.unwrap();
}

// =============================================================================
// 9. Reconciliation
// =============================================================================

async fn plant_orphan(h: &Harness, id: &str, scope: &str) -> Sandbox {
    let req = request(scope);
    let orphan = Sandbox::creating(
        SandboxId::from(id),
        &req,
        scope.into(),
        "mock",
        "1.0.0",
        Utc::now(),
    );
    h.repo.create(&orphan).await.unwrap()
}

#[tokio::test]
async fn test_reconciler_reclaims_stale_creating_rows() {
    let h = memory_harness();
    let orphan = plant_orphan(&h, "orphan", "/p/src").await;

    // The orphan still holds its scope.
    let err = h.manager.create(&alice(), &request("/p/src")).await.unwrap_err();
    assert!(matches!(err, Error::PathConflict { .. }));

    let reconciler = Reconciler::new(h.manager.clone(), Duration::ZERO);
    let reclaimed = reconciler.sweep(&CallContext::system()).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, orphan.id);
    assert_eq!(reclaimed[0].status, SandboxStatus::Error);
    assert!(reclaimed[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("reclaimed"));

    let trail = h
        .manager
        .audit_trail(&alice(), &orphan.id)
        .await
        .unwrap();
    assert_eq!(trail.last().unwrap().event_type, AuditEventType::OrphanReclaimed);
    assert_eq!(trail.last().unwrap().actor_type, OwnerType::System);

    h.manager.create(&alice(), &request("/p/src")).await.unwrap();
}

#[tokio::test]
async fn test_reconciler_respects_grace_period() {
    let h = memory_harness();
    plant_orphan(&h, "young", "/p/src").await;

    let reconciler = Reconciler::new(h.manager.clone(), Duration::from_secs(3600));
    assert!(reconciler
        .sweep(&CallContext::system())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconciler_loop_stops_on_cancel() {
    let h = memory_harness();
    plant_orphan(&h, "orphan", "/p/src").await;

    let token = CancellationToken::new();
    let reconciler = Reconciler::new(h.manager.clone(), Duration::ZERO);
    let ctx = CallContext::system().with_cancellation(token.clone());
    let task = tokio::spawn(async move {
        reconciler
            .run(ctx, Duration::from_secs(10), Duration::from_secs(10))
            .await
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();
    task.await.unwrap();

    let orphan = h
        .manager
        .get(&alice(), &SandboxId::from("orphan"))
        .await
        .unwrap();
    assert_eq!(orphan.status, SandboxStatus::Error);
}

// =============================================================================
// 10. Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancelled_call_does_nothing() {
    let h = memory_harness();
    let token = CancellationToken::new();
    token.cancel();
    let ctx = alice().with_cancellation(token);

    let err = h.manager.create(&ctx, &request("/p/src")).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(h.repo.list(&ListFilter::default()).await.unwrap().items.is_empty());
    assert_eq!(h.driver.calls(DriverOp::Prepare), 0);
    assert!(rejections(&h).await.is_empty());
}

// =============================================================================
// 11. Store failure after driver mutation
// =============================================================================

/// Countdown of injected failures, shared with open transactions.
#[derive(Default)]
struct Faults {
    writes: AtomicUsize,
    audits: AtomicUsize,
}

fn take_fault(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Repository that fails the next N version-checked writes or audit appends,
/// inside transactions or not.
struct FlakyRepository {
    inner: InMemorySandboxRepository,
    faults: Arc<Faults>,
}

impl FlakyRepository {
    fn new() -> Self {
        Self {
            inner: InMemorySandboxRepository::new(),
            faults: Arc::new(Faults::default()),
        }
    }

    fn fail_next_writes(&self, n: usize) {
        self.faults.writes.store(n, Ordering::SeqCst);
    }

    fn fail_next_audits(&self, n: usize) {
        self.faults.audits.store(n, Ordering::SeqCst);
    }
}

struct FlakyTransaction {
    inner: Box<dyn SandboxTransaction>,
    faults: Arc<Faults>,
}

#[async_trait]
impl SandboxTransaction for FlakyTransaction {
    async fn check_scope_overlap(
        &mut self,
        r: &str,
        p: &str,
        e: Option<&SandboxId>,
    ) -> workspace_sandbox_core::Result<Vec<Sandbox>> {
        self.inner.check_scope_overlap(r, p, e).await
    }
    async fn find_by_idempotency_key(
        &mut self,
        k: &str,
    ) -> workspace_sandbox_core::Result<Option<Sandbox>> {
        self.inner.find_by_idempotency_key(k).await
    }
    async fn create(&mut self, s: &Sandbox) -> workspace_sandbox_core::Result<Sandbox> {
        self.inner.create(s).await
    }
    async fn update_with_version_check(
        &mut self,
        s: &Sandbox,
        v: u64,
    ) -> workspace_sandbox_core::Result<Sandbox> {
        if take_fault(&self.faults.writes) {
            return Err(Error::storage("disk I/O error"));
        }
        self.inner.update_with_version_check(s, v).await
    }
    async fn log_audit_event(
        &mut self,
        e: &AuditEvent,
    ) -> workspace_sandbox_core::Result<AuditEvent> {
        if take_fault(&self.faults.audits) {
            return Err(Error::storage("audit log full"));
        }
        self.inner.log_audit_event(e).await
    }
    async fn commit(self: Box<Self>) -> workspace_sandbox_core::Result<()> {
        self.inner.commit().await
    }
    async fn rollback(self: Box<Self>) -> workspace_sandbox_core::Result<()> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl SandboxRepository for FlakyRepository {
    async fn create(&self, s: &Sandbox) -> workspace_sandbox_core::Result<Sandbox> {
        self.inner.create(s).await
    }
    async fn get(&self, id: &SandboxId) -> workspace_sandbox_core::Result<Option<Sandbox>> {
        self.inner.get(id).await
    }
    async fn update(&self, s: &Sandbox) -> workspace_sandbox_core::Result<Sandbox> {
        self.inner.update(s).await
    }
    async fn update_with_version_check(
        &self,
        s: &Sandbox,
        v: u64,
    ) -> workspace_sandbox_core::Result<Sandbox> {
        if take_fault(&self.faults.writes) {
            return Err(Error::storage("disk I/O error"));
        }
        self.inner.update_with_version_check(s, v).await
    }
    async fn delete(&self, id: &SandboxId) -> workspace_sandbox_core::Result<Sandbox> {
        self.inner.delete(id).await
    }
    async fn list(&self, f: &ListFilter) -> workspace_sandbox_core::Result<SandboxPage> {
        self.inner.list(f).await
    }
    async fn check_scope_overlap(
        &self,
        r: &str,
        p: &str,
        e: Option<&SandboxId>,
    ) -> workspace_sandbox_core::Result<Vec<Sandbox>> {
        self.inner.check_scope_overlap(r, p, e).await
    }
    async fn find_by_idempotency_key(
        &self,
        k: &str,
    ) -> workspace_sandbox_core::Result<Option<Sandbox>> {
        self.inner.find_by_idempotency_key(k).await
    }
    async fn log_audit_event(&self, e: &AuditEvent) -> workspace_sandbox_core::Result<AuditEvent> {
        if take_fault(&self.faults.audits) {
            return Err(Error::storage("audit log full"));
        }
        self.inner.log_audit_event(e).await
    }
    async fn list_audit_events(
        &self,
        f: &AuditFilter,
    ) -> workspace_sandbox_core::Result<Vec<AuditEvent>> {
        self.inner.list_audit_events(f).await
    }
    async fn get_stats(&self) -> workspace_sandbox_core::Result<SandboxStats> {
        self.inner.get_stats().await
    }
    async fn begin_tx(&self) -> workspace_sandbox_core::Result<Box<dyn SandboxTransaction>> {
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin_tx().await?,
            faults: self.faults.clone(),
        }))
    }
}

#[tokio::test]
async fn test_store_failure_after_activation_is_reversed() {
    let flaky = Arc::new(FlakyRepository::new());
    let h = harness_with(flaky.clone(), MockDriver::new(), ManagerOptions::new("mock"));
    flaky.fail_next_writes(1);

    let err = h.manager.create(&alice(), &request("/p/src")).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));

    let rows = h.repo.list(&ListFilter::default()).await.unwrap().items;
    assert_eq!(rows.len(), 1);
    let stuck = &rows[0];
    // Stored state is still creating, so the overlay was torn down to match.
    assert_eq!(stuck.status, SandboxStatus::Creating);
    assert!(!h.driver.has_artifacts(&stuck.id));
    assert_eq!(
        event_types(&h, &stuck.id).await,
        vec![AuditEventType::Created, AuditEventType::TransitionFailed]
    );
}

#[tokio::test]
async fn test_unreversible_store_failure_is_flagged_inconsistent() {
    let flaky = Arc::new(FlakyRepository::new());
    let h = harness_with(flaky.clone(), MockDriver::new(), ManagerOptions::new("mock"));
    flaky.fail_next_writes(1);
    h.driver
        .fail_on(DriverOp::Destroy, DriverError::Backend("device busy".into()));

    let err = h.manager.create(&alice(), &request("/p/src")).await.unwrap_err();
    let Error::StoreInconsistent { sandbox_id, detail } = err else {
        panic!("expected StoreInconsistent");
    };
    assert!(detail.contains("reversal failed"));

    let flagged = h.manager.get(&alice(), &sandbox_id).await.unwrap();
    assert_eq!(flagged.status, SandboxStatus::Error);
    assert_eq!(flagged.error_message.as_deref(), Some(detail.as_str()));
    assert_eq!(
        event_types(&h, &sandbox_id).await.last(),
        Some(&AuditEventType::StoreInconsistent)
    );
}

#[tokio::test]
async fn test_store_failure_after_stop_remounts() {
    let flaky = Arc::new(FlakyRepository::new());
    let h = harness_with(flaky.clone(), MockDriver::new(), ManagerOptions::new("mock"));
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    flaky.fail_next_writes(1);

    let err = h.manager.stop(&alice(), &x.id, x.version).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert!(h.driver.is_active(&x.id));
    assert_eq!(h.manager.get(&alice(), &x.id).await.unwrap().status, SandboxStatus::Active);
}

#[tokio::test]
async fn test_failed_audit_append_leaves_transition_uncommitted() {
    let flaky = Arc::new(FlakyRepository::new());
    let h = harness_with(flaky.clone(), MockDriver::new(), ManagerOptions::new("mock"));
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    let x = h.manager.stop(&alice(), &x.id, x.version).await.unwrap();
    flaky.fail_next_audits(1);

    let err = h.manager.approve(&alice(), &x.id, x.version).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));

    let stored = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(stored.status, SandboxStatus::Stopped);
    assert_eq!(stored.version, x.version);
    assert_eq!(
        event_types(&h, &x.id).await,
        vec![
            AuditEventType::Created,
            AuditEventType::Activated,
            AuditEventType::Stopped
        ]
    );

    // The same version still applies once the audit log accepts writes.
    let approved = h.manager.approve(&alice(), &x.id, x.version).await.unwrap();
    assert_eq!(approved.status, SandboxStatus::Approved);
}

#[tokio::test]
async fn test_failed_audit_append_after_stop_remounts() {
    let flaky = Arc::new(FlakyRepository::new());
    let h = harness_with(flaky.clone(), MockDriver::new(), ManagerOptions::new("mock"));
    let x = h.manager.create(&alice(), &request("/p/src")).await.unwrap();
    flaky.fail_next_audits(1);

    let err = h.manager.stop(&alice(), &x.id, x.version).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));

    let stored = h.manager.get(&alice(), &x.id).await.unwrap();
    assert_eq!(stored.status, SandboxStatus::Active);
    assert_eq!(stored.version, x.version);
    assert!(h.driver.is_active(&x.id));
    assert!(!event_types(&h, &x.id).await.contains(&AuditEventType::Stopped));
}
