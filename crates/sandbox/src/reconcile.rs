//! Background reconciliation.
//!
//! A create that dies between reserving its scope and publishing `active`
//! leaves a `creating` row that keeps holding the reservation. The reconciler
//! reclaims such rows once they are older than the grace period, and drives
//! the periodic telemetry refresh.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use workspace_sandbox_core::{
    CallContext, Error, ListFilter, Result, Sandbox, SandboxStatus, MAX_LIST_LIMIT,
};

use crate::lifecycle::SandboxManager;

pub struct Reconciler {
    manager: Arc<SandboxManager>,
    orphan_grace: Duration,
}

impl Reconciler {
    pub fn new(manager: Arc<SandboxManager>, orphan_grace: Duration) -> Self {
        Self {
            manager,
            orphan_grace,
        }
    }

    /// Reclaim every `creating` sandbox older than the grace period.
    pub async fn sweep(&self, ctx: &CallContext) -> Result<Vec<Sandbox>> {
        let grace = chrono::Duration::from_std(self.orphan_grace)
            .map_err(|e| Error::Config(format!("orphan grace out of range: {}", e)))?;
        let mut filter = ListFilter::default()
            .with_status(SandboxStatus::Creating)
            .with_page(MAX_LIST_LIMIT as i64, 0);
        filter.created_to = Some(Utc::now() - grace);

        let orphans = self.manager.list(ctx, &filter).await?.items;
        let reason = format!(
            "stayed in creating for more than {}s; reclaimed by reconciliation",
            self.orphan_grace.as_secs()
        );

        let mut reclaimed = Vec::new();
        for orphan in orphans {
            ctx.ensure_active()?;
            match self.manager.reclaim_orphan(ctx, &orphan, &reason).await {
                Ok(sandbox) => reclaimed.push(sandbox),
                Err(Error::ConcurrentModification { .. }) => {
                    tracing::debug!(sandbox_id = %orphan.id, "Sandbox settled before it was reclaimed");
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %orphan.id, error = %e, "Failed to reclaim orphan");
                }
            }
        }

        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "Orphaned sandboxes reclaimed");
        }
        Ok(reclaimed)
    }

    /// Run sweeps and telemetry refreshes until `ctx` is cancelled.
    pub async fn run(&self, ctx: CallContext, reconcile_every: Duration, telemetry_every: Duration) {
        let mut reconcile = tokio::time::interval(reconcile_every);
        let mut telemetry = tokio::time::interval(telemetry_every);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        telemetry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            reconcile_secs = reconcile_every.as_secs(),
            telemetry_secs = telemetry_every.as_secs(),
            "Reconciler started"
        );
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = reconcile.tick() => {
                    match self.sweep(&ctx).await {
                        Ok(_) | Err(Error::Cancelled) => {}
                        Err(e) => tracing::warn!(error = %e, "Reconciliation sweep failed"),
                    }
                }
                _ = telemetry.tick() => {
                    match self.manager.refresh_all_telemetry(&ctx).await {
                        Ok(_) | Err(Error::Cancelled) => {}
                        Err(e) => tracing::warn!(error = %e, "Telemetry refresh failed"),
                    }
                }
            }
        }
        tracing::info!("Reconciler stopped");
    }
}
