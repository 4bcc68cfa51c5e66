use chrono::{Duration as ChronoDuration, Utc};
use futures_util::{stream, StreamExt};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    cycle::{run_cycle, CycleOutcome, CycleReport},
    error::SyncResult,
    ledger,
    models::Tenant,
    state::EngineState,
    tenants,
};

/// Polls the tenant list and runs due cycles with bounded concurrency.
pub struct Scheduler {
    state: EngineState,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(state: EngineState) -> Self {
        Self {
            state,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the poll loop. Running cycles release
    /// their ledger rows and [`Scheduler::run`] returns once they have.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        let sync = &self.state.config.sync;
        info!(
            max_concurrent_tenants = sync.max_concurrent_tenants,
            poll_interval_secs = sync.poll_interval.as_secs(),
            "sync scheduler started"
        );
        while !self.shutdown.is_cancelled() {
            match self.tick().await {
                Ok(reports) if !reports.is_empty() => {
                    let failed = reports
                        .iter()
                        .filter(|r| matches!(r.outcome, CycleOutcome::Failed { .. }))
                        .count();
                    info!(tenants = reports.len(), failed, "scheduler tick finished");
                }
                Ok(_) => debug!("no tenants due"),
                Err(err) => error!(error = %err, "scheduler tick failed"),
            }
            tokio::select! {
                _ = sleep(sync.poll_interval) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
        info!("sync scheduler stopped");
    }

    /// Runs every due tenant once. One tenant failing never stops the others.
    pub async fn tick(&self) -> SyncResult<Vec<CycleReport>> {
        let due = self.due_tenants().await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let limit = self.state.config.sync.max_concurrent_tenants.max(1);
        let reports = stream::iter(due)
            .map(|tenant| {
                let state = self.state.clone();
                let shutdown = self.shutdown.clone();
                let tenant_id = tenant.id;
                async move {
                    let handle =
                        tokio::spawn(async move { run_cycle(&state, &tenant, &shutdown).await });
                    match handle.await {
                        Ok(report) => Some(report),
                        Err(err) => {
                            error!(tenant_id = %tenant_id, error = %err, "sync cycle task aborted");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(limit)
            .filter_map(|report| async move { report })
            .collect::<Vec<_>>()
            .await;
        Ok(reports)
    }

    pub async fn due_tenants(&self) -> SyncResult<Vec<Tenant>> {
        let sync = self.state.config.sync.clone();
        self.state
            .with_db(move |conn| {
                let now = Utc::now().naive_utc();
                let trigger_window = ChronoDuration::minutes(sync.manual_trigger_window_minutes);
                let mut due = Vec::new();
                for tenant in tenants::load_sync_enabled(conn)? {
                    let interval = ChronoDuration::minutes(tenants::sync_interval_minutes(
                        &tenant,
                        sync.default_interval_minutes,
                    ));
                    let states = ledger::load_tenant_states(conn, tenant.id)?;
                    if ledger::is_due(&states, now, interval, trigger_window) {
                        due.push(tenant);
                    }
                }
                Ok(due)
            })
            .await
    }
}
