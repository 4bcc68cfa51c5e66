//! One tenant's sync cycle: tunnel, extract, merge, link, record.
//!
//! All three ledger rows are acquired up front so a tenant never overlaps
//! with itself, even across engine instances. Cursors advance only after a
//! batch has been merged, so an aborted cycle resumes from the last
//! committed batch on the next run.

use std::fmt;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{SyncError, SyncResult},
    ledger::{self, Acquired, Lease, LedgerError, SyncKind},
    linker::{self, LinkReport},
    merge::{self, MergeReport},
    models::Tenant,
    remote::{CursorPosition, RemoteClient},
    state::EngineState,
    tenants,
    tunnel::Tunnel,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// Another run holds the ledger; not an error.
    Skipped,
    /// Shutdown interrupted the cycle; held ledger rows were released.
    Cancelled,
    Failed { kind: Option<SyncKind>, error: String },
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Completed => f.write_str("completed"),
            CycleOutcome::Skipped => f.write_str("skipped"),
            CycleOutcome::Cancelled => f.write_str("cancelled"),
            CycleOutcome::Failed { kind: Some(kind), error } => {
                write!(f, "failed during {kind}: {error}")
            }
            CycleOutcome::Failed { kind: None, error } => write!(f, "failed: {error}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub tenant_id: Uuid,
    pub outcome: CycleOutcome,
    pub extensions: MergeReport,
    pub conversations: MergeReport,
    pub participants: MergeReport,
    pub messages: MergeReport,
    pub batches: usize,
    pub links: LinkReport,
}

impl CycleReport {
    fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            outcome: CycleOutcome::Completed,
            extensions: MergeReport::default(),
            conversations: MergeReport::default(),
            participants: MergeReport::default(),
            messages: MergeReport::default(),
            batches: 0,
            links: LinkReport::default(),
        }
    }

    fn with_outcome(mut self, outcome: CycleOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    fn failed(mut self, kind: Option<SyncKind>, error: &SyncError) -> Self {
        self.outcome = CycleOutcome::Failed {
            kind,
            error: error.to_string(),
        };
        self
    }
}

/// Runs a full cycle. Every failure is captured in the report.
///
/// Cancelling `shutdown` abandons the cycle at its next await point and hands
/// every ledger row it still holds back as `idle`, so the tenant resumes from
/// its last committed cursor on the next run.
pub async fn run_cycle(
    state: &EngineState,
    tenant: &Tenant,
    shutdown: &CancellationToken,
) -> CycleReport {
    if shutdown.is_cancelled() {
        return CycleReport::new(tenant.id).with_outcome(CycleOutcome::Cancelled);
    }

    let held = match acquire(state, tenant.id).await {
        Ok(Some(held)) => held,
        Ok(None) => {
            info!(tenant_id = %tenant.id, "sync already running elsewhere; skipping tenant");
            return CycleReport::new(tenant.id).with_outcome(CycleOutcome::Skipped);
        }
        Err(err) => {
            warn!(tenant_id = %tenant.id, error = %err, "could not acquire sync ledger");
            return CycleReport::new(tenant.id).failed(None, &err);
        }
    };

    let report = tokio::select! {
        report = sync_tenant(state, tenant, &held) => report,
        _ = shutdown.cancelled() => {
            warn!(tenant_id = %tenant.id, "sync cycle interrupted by shutdown; releasing ledger");
            finish_kinds(state, tenant.id, &leases(&held), None).await;
            return CycleReport::new(tenant.id).with_outcome(CycleOutcome::Cancelled);
        }
    };

    let report = link_and_touch(state, tenant.id, report).await;
    info!(
        tenant_id = %tenant.id,
        outcome = %report.outcome,
        batches = report.batches,
        conversations = report.conversations.touched(),
        messages = report.messages.touched(),
        linked = report.links.linked,
        "sync cycle finished"
    );
    report
}

async fn sync_tenant(state: &EngineState, tenant: &Tenant, held: &[Acquired]) -> CycleReport {
    let report = CycleReport::new(tenant.id);

    let tunnel = match open_tunnel(state, tenant).await {
        Ok(tunnel) => tunnel,
        Err(err) => {
            finish_kinds(state, tenant.id, &leases(held), Some(&err)).await;
            return report.failed(None, &err);
        }
    };

    let report = match connect_remote(state, tenant, &tunnel).await {
        Ok(client) => extract_and_merge(state, tenant.id, &client, held, report).await,
        Err(err) => {
            finish_kinds(state, tenant.id, &leases(held), Some(&err)).await;
            report.failed(None, &err)
        }
    };
    tunnel.close().await;
    report
}

fn leases(held: &[Acquired]) -> Vec<Lease> {
    held.iter().map(|acquired| acquired.lease).collect()
}

/// Begins every kind, or none: a conflict on any kind releases the rest.
async fn acquire(state: &EngineState, tenant_id: Uuid) -> SyncResult<Option<Vec<Acquired>>> {
    let stale_after = state.config.sync.stale_after_minutes;
    state
        .with_db(move |conn| {
            let stale_before = ledger::stale_threshold(stale_after);
            let mut held: Vec<Acquired> = Vec::with_capacity(SyncKind::ALL.len());
            for kind in SyncKind::ALL {
                match ledger::begin(conn, tenant_id, kind, stale_before) {
                    Ok(acquired) => held.push(acquired),
                    Err(err) => {
                        for acquired in &held {
                            ledger::release(conn, &acquired.lease)?;
                        }
                        return match err {
                            LedgerError::AlreadyRunning { .. } => Ok(None),
                            other => Err(other.into()),
                        };
                    }
                }
            }
            Ok(Some(held))
        })
        .await
}

async fn open_tunnel(state: &EngineState, tenant: &Tenant) -> SyncResult<Tunnel> {
    let opened = match tenants::tunnel_params(tenant, &state.config.tunnel) {
        Ok(params) => Tunnel::open(&params).await,
        Err(err) => Err(err),
    };
    opened.map_err(|err| {
        warn!(
            tenant_id = %tenant.id,
            stage = %err.stage(),
            error = %err,
            "tunnel failed"
        );
        SyncError::Connectivity(err)
    })
}

async fn connect_remote(
    state: &EngineState,
    tenant: &Tenant,
    tunnel: &Tunnel,
) -> SyncResult<RemoteClient> {
    let url = tenants::remote_database_url(tenant, tunnel.local_port())?;
    RemoteClient::connect(
        url,
        state.config.tunnel.statement_timeout,
        state.config.sync.batch_size,
    )
    .await
}

/// Releases each lease, or marks each failed with the error.
async fn finish_kinds(
    state: &EngineState,
    tenant_id: Uuid,
    leases: &[Lease],
    error: Option<&SyncError>,
) {
    if leases.is_empty() {
        return;
    }
    let leases = leases.to_vec();
    let message = error.map(ToString::to_string);
    let result = state
        .with_db(move |conn| {
            for lease in &leases {
                match &message {
                    Some(message) => ledger::fail(conn, lease, message)?,
                    None => {
                        ledger::release(conn, lease)?;
                    }
                }
            }
            Ok(())
        })
        .await;
    if let Err(err) = result {
        warn!(tenant_id = %tenant_id, error = %err, "could not update sync ledger");
    }
}

async fn extract_and_merge(
    state: &EngineState,
    tenant_id: Uuid,
    client: &RemoteClient,
    held: &[Acquired],
    mut report: CycleReport,
) -> CycleReport {
    let extraction = Extraction {
        state,
        tenant_id,
        client,
        max_batches: state.config.sync.max_batches_per_cycle,
    };

    for (position, acquired) in held.iter().enumerate() {
        let lease = acquired.lease;
        let cursor = CursorPosition::from_ledger(acquired.state.cursor.as_ref());
        let result = match lease.kind {
            SyncKind::Extensions => extraction.extensions(&lease, &mut report).await.map(|_| None),
            SyncKind::Conversations => extraction
                .conversations(&lease, cursor, &mut report)
                .await
                .map(|cursor| Some(cursor.to_ledger())),
            SyncKind::Messages => extraction
                .messages(&lease, cursor, &mut report)
                .await
                .map(|cursor| Some(cursor.to_ledger())),
        };

        let committed = match result {
            Ok(cursor) => {
                state
                    .with_db(move |conn| Ok(ledger::commit(conn, &lease, cursor.as_ref())?))
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = committed {
            warn!(tenant_id = %tenant_id, sync_kind = %lease.kind, error = %err, "sync step failed");
            finish_kinds(state, tenant_id, &[lease], Some(&err)).await;
            // Later kinds depend on this one; hand them back untouched.
            finish_kinds(state, tenant_id, &leases(&held[position + 1..]), None).await;
            return report.failed(Some(lease.kind), &err);
        }
    }
    report
}

async fn link_and_touch(state: &EngineState, tenant_id: Uuid, mut report: CycleReport) -> CycleReport {
    if matches!(report.outcome, CycleOutcome::Skipped | CycleOutcome::Cancelled) {
        return report;
    }
    let recent_window = state.config.linker_recent_window;
    let completed = report.outcome == CycleOutcome::Completed;
    let result = state
        .with_db(move |conn| {
            let links = linker::link_orphans(conn, tenant_id, recent_window)?;
            if completed {
                let latest = merge::latest_message_at(conn, tenant_id)?;
                tenants::touch_sync(conn, tenant_id, latest)?;
            }
            Ok(links)
        })
        .await;
    match result {
        Ok(links) => report.links = links,
        Err(err) => warn!(tenant_id = %tenant_id, error = %err, "media link pass failed"),
    }
    report
}

struct Extraction<'a> {
    state: &'a EngineState,
    tenant_id: Uuid,
    client: &'a RemoteClient,
    max_batches: usize,
}

impl Extraction<'_> {
    /// Extensions are small and have no change timestamp, so they are re-read in full.
    async fn extensions(&self, lease: &Lease, report: &mut CycleReport) -> SyncResult<()> {
        let tenant_id = self.tenant_id;
        let mut after: Option<String> = None;
        loop {
            let rows = self.client.extensions_after(after.clone()).await?;
            let full = rows.len() as i64 >= self.client.batch_size();
            after = rows.last().map(|row| row.number.clone());
            if rows.is_empty() {
                return Ok(());
            }
            let merged = self
                .state
                .with_db(move |conn| merge::merge_extensions(conn, tenant_id, &rows))
                .await?;
            report.extensions.absorb(merged);
            report.batches += 1;
            self.heartbeat(lease).await?;
            if !full {
                return Ok(());
            }
        }
    }

    async fn conversations(
        &self,
        lease: &Lease,
        mut cursor: CursorPosition,
        report: &mut CycleReport,
    ) -> SyncResult<CursorPosition> {
        let tenant_id = self.tenant_id;
        for _ in 0..self.max_batches {
            let page = self.client.conversations_page(&cursor).await?;
            let Some(next) = page.next.clone() else {
                break;
            };
            let ids: Vec<String> = page.rows.iter().map(|r| r.row.external_id.clone()).collect();
            let participants = self.client.participants_for(ids).await?;
            let rows = page.rows;

            let (conversations, participants) = self
                .state
                .with_db(move |conn| {
                    let conversations = merge::merge_conversations(conn, tenant_id, &rows)?;
                    let participants = merge::merge_participants(conn, tenant_id, &participants)?;
                    Ok((conversations, participants))
                })
                .await?;
            report.conversations.absorb(conversations);
            report.participants.absorb(participants);
            report.batches += 1;

            self.advance(lease, &next).await?;
            cursor = next;
            if page.exhausted {
                break;
            }
        }
        Ok(cursor)
    }

    async fn messages(
        &self,
        lease: &Lease,
        mut cursor: CursorPosition,
        report: &mut CycleReport,
    ) -> SyncResult<CursorPosition> {
        let tenant_id = self.tenant_id;
        for _ in 0..self.max_batches {
            let page = self.client.messages_page(&cursor).await?;
            let Some(next) = page.next.clone() else {
                break;
            };

            let referenced: Vec<String> = page
                .rows
                .iter()
                .map(|r| r.row.conversation_external_id.clone())
                .collect();
            let missing = self
                .state
                .with_db(move |conn| merge::missing_conversations(conn, tenant_id, &referenced))
                .await?;
            if !missing.is_empty() {
                self.backfill_conversations(missing, report).await?;
            }

            let rows = page.rows;
            let merged = self
                .state
                .with_db(move |conn| merge::merge_messages(conn, tenant_id, &rows))
                .await?;
            report.messages.absorb(merged);
            report.batches += 1;

            self.advance(lease, &next).await?;
            cursor = next;
            if page.exhausted {
                break;
            }
        }
        Ok(cursor)
    }

    /// Fetches and merges conversations a message batch refers to but that
    /// have not been merged yet, so messages never point at nothing.
    async fn backfill_conversations(
        &self,
        missing: Vec<String>,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let tenant_id = self.tenant_id;
        info!(tenant_id = %tenant_id, count = missing.len(), "backfilling referenced conversations");
        let conversations = self.client.conversations_by_ids(missing.clone()).await?;
        let participants = self.client.participants_for(missing).await?;
        let (conversations, participants) = self
            .state
            .with_db(move |conn| {
                let conversations = merge::merge_conversations(conn, tenant_id, &conversations)?;
                let participants = merge::merge_participants(conn, tenant_id, &participants)?;
                Ok((conversations, participants))
            })
            .await?;
        report.conversations.absorb(conversations);
        report.participants.absorb(participants);
        Ok(())
    }

    async fn advance(&self, lease: &Lease, next: &CursorPosition) -> SyncResult<()> {
        let lease = *lease;
        let value: Value = next.to_ledger();
        self.state
            .with_db(move |conn| Ok(ledger::advance(conn, &lease, &value)?))
            .await
    }

    async fn heartbeat(&self, lease: &Lease) -> SyncResult<()> {
        let lease = *lease;
        self.state
            .with_db(move |conn| Ok(ledger::heartbeat(conn, &lease)?))
            .await
    }
}
