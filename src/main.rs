#![deny(unused)]
//! sandboxd - workspace sandbox manager daemon.
//!
//! Wires the sandbox store, overlay drivers and lifecycle engine together and
//! runs orphan reconciliation and telemetry refresh until interrupted.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use workspace_sandbox_core::config::{AppConfig, StoreBackend};
use workspace_sandbox_core::{CallContext, SandboxRepository};
use workspace_sandbox_engine::{
    DriverRegistry, ManagerOptions, OverlayDriver, OverlayFsDriver, Reconciler, SandboxManager,
};
use workspace_sandbox_store::{InMemorySandboxRepository, SqliteSandboxRepository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_error) = match AppConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    workspace_sandbox_governance::configure_tracing(config.governance.json_logs)?;
    if let Some(e) = config_error {
        tracing::warn!(error = %e, "Failed to load configuration, using defaults");
    }
    tracing::info!("Starting sandboxd v{}", env!("CARGO_PKG_VERSION"));

    let _metrics_handle =
        workspace_sandbox_governance::setup_metrics_recorder(config.governance.metrics_listen)?;

    // =========================================================================
    // Store
    // =========================================================================
    let repo: Arc<dyn SandboxRepository> = match config.store.backend {
        StoreBackend::Sqlite => {
            if let Some(parent) = config.store.sqlite_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tracing::info!(
                path = %config.store.sqlite_path.display(),
                "Initializing SQLite sandbox store"
            );
            Arc::new(SqliteSandboxRepository::open(&config.store.sqlite_path)?)
        }
        StoreBackend::Memory => {
            tracing::warn!("Initializing in-memory sandbox store; records are lost on restart");
            Arc::new(InMemorySandboxRepository::new())
        }
    };

    // =========================================================================
    // Drivers
    // =========================================================================
    let drivers = Arc::new(DriverRegistry::new());
    let overlayfs = Arc::new(OverlayFsDriver::new(config.sandbox.overlay_base_dir.clone()));
    if !overlayfs.is_available().await {
        tracing::warn!("Kernel overlay filesystem not available; overlayfs mounts will fail");
    }
    drivers.register(overlayfs);

    let default_driver = drivers.resolve(
        &config.sandbox.default_driver,
        config.sandbox.driver_version.as_deref(),
    )?;
    let capabilities = default_driver.capabilities();
    tracing::info!(
        driver = %default_driver.name(),
        version = %default_driver.version(),
        resumable = capabilities.resumable,
        requires_privilege = capabilities.requires_privilege,
        case_sensitive_paths = config.sandbox.case_sensitive_paths,
        "Default overlay driver resolved"
    );

    // =========================================================================
    // Lifecycle engine
    // =========================================================================
    let manager = Arc::new(SandboxManager::new(
        repo,
        drivers,
        ManagerOptions::from_config(&config.sandbox),
    ));

    let stats = manager.stats(&CallContext::system()).await?;
    tracing::info!(
        total = stats.total(),
        active = stats.active,
        creating = stats.creating,
        error = stats.error,
        "Sandbox store ready"
    );

    let shutdown = CancellationToken::new();
    let reconciler = Reconciler::new(manager.clone(), config.sandbox.orphan_grace());
    let ctx = CallContext::system().with_cancellation(shutdown.clone());
    let reconcile_every = config.sandbox.reconcile_interval();
    let telemetry_every = config.sandbox.telemetry_interval();
    let background = tokio::spawn(async move {
        reconciler.run(ctx, reconcile_every, telemetry_every).await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
    background.await?;

    tracing::info!("sandboxd stopped");
    Ok(())
}
