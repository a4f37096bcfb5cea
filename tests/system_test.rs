//! System tests: the daemon's wiring over a SQLite file, across restarts.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use workspace_sandbox_core::{
    AuditEventType, CallContext, CreateRequest, Error, ListFilter, OwnerType, Sandbox, SandboxId,
    SandboxStatus,
};
use workspace_sandbox_engine::{
    DriverRegistry, ManagerOptions, MockDriver, Reconciler, SandboxManager,
};
use workspace_sandbox_store::SqliteSandboxRepository;

// =============================================================================
// Helpers
// =============================================================================

fn open_manager(db: &std::path::Path, driver: Arc<MockDriver>) -> Arc<SandboxManager> {
    let repo = Arc::new(SqliteSandboxRepository::open(db).unwrap());
    let drivers = Arc::new(DriverRegistry::new());
    drivers.register(driver);
    Arc::new(SandboxManager::new(repo, drivers, ManagerOptions::new("mock")))
}

fn agent() -> CallContext {
    CallContext::new("agent-7", OwnerType::Agent)
}

// =============================================================================
// 1. Records and reservations survive a restart
// =============================================================================

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sandboxes.db");
    let driver = Arc::new(MockDriver::new());

    let created = {
        let manager = open_manager(&db, driver.clone());
        let request = CreateRequest::new("/repo", "/repo/src", "agent-7")
            .with_owner_type(OwnerType::Agent)
            .with_tag("refactor")
            .with_metadata("ticket", json!("ENG-12"))
            .with_idempotency_key("job-1");
        manager.create(&agent(), &request).await.unwrap()
    };

    let manager = open_manager(&db, driver.clone());
    let reloaded = manager.get(&agent(), &created.id).await.unwrap();
    assert_eq!(reloaded, created);
    assert!(reloaded.tags.contains("refactor"));
    assert_eq!(reloaded.metadata["ticket"], json!("ENG-12"));

    // Reservation is still held after reopening.
    let err = manager
        .create(&agent(), &CreateRequest::new("/repo", "/repo/src/lib", "other"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PathConflict { .. }));

    // Idempotent replay works against the reopened store.
    let replay = manager
        .create(
            &agent(),
            &CreateRequest::new("/repo", "/repo/src", "agent-7").with_idempotency_key("job-1"),
        )
        .await
        .unwrap();
    assert_eq!(replay.id, created.id);
}

// =============================================================================
// 2. Crash between reserve and activate is reclaimed after restart
// =============================================================================

#[tokio::test]
async fn test_crashed_create_is_reclaimed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sandboxes.db");
    let driver = Arc::new(MockDriver::new());

    // A process that dies after the reservation commits leaves a `creating` row.
    {
        let manager = open_manager(&db, driver.clone());
        let request = CreateRequest::new("/repo", "/repo/src", "agent-7");
        let record = Sandbox::creating(
            SandboxId::from("crashed"),
            &request,
            "/repo/src".into(),
            "mock",
            "1.0.0",
            Utc::now(),
        );
        manager.repository().create(&record).await.unwrap();

        let err = manager.create(&agent(), &request).await.unwrap_err();
        assert!(matches!(err, Error::PathConflict { .. }));
    }

    let manager = open_manager(&db, driver);
    let reconciler = Reconciler::new(manager.clone(), Duration::ZERO);
    let reclaimed = reconciler.sweep(&CallContext::system()).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].status, SandboxStatus::Error);

    let fresh = manager
        .create(&agent(), &CreateRequest::new("/repo", "/repo/src", "agent-7"))
        .await
        .unwrap();
    assert_eq!(fresh.status, SandboxStatus::Active);

    let page = manager
        .list(
            &agent(),
            &ListFilter::from_json(json!({"status": ["error"], "limit": 10})).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);

    let trail = manager
        .audit_trail(&agent(), &reclaimed[0].id)
        .await
        .unwrap();
    assert_eq!(
        trail.iter().map(|e| e.event_type).collect::<Vec<_>>(),
        vec![AuditEventType::OrphanReclaimed]
    );
}

// =============================================================================
// 3. Stats reflect the whole store
// =============================================================================

#[tokio::test]
async fn test_stats_across_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(&dir.path().join("sandboxes.db"), Arc::new(MockDriver::new()));
    let ctx = agent();

    let a = manager
        .create(&ctx, &CreateRequest::new("/repo", "/repo/a", "agent-7"))
        .await
        .unwrap();
    let b = manager
        .create(&ctx, &CreateRequest::new("/repo", "/repo/b", "agent-7"))
        .await
        .unwrap();
    manager
        .create(&ctx, &CreateRequest::new("/repo", "/repo/c", "agent-7"))
        .await
        .unwrap();
    manager.stop(&ctx, &a.id, a.version).await.unwrap();
    manager.delete(&ctx, &b.id, b.version).await.unwrap();

    let stats = manager.stats(&ctx).await.unwrap();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.stopped, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.total(), 3);
}
