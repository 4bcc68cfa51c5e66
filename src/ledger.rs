use std::{fmt, str::FromStr};

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::{
    connection::SimpleConnection,
    pg::PgConnection,
    prelude::*,
    sql_types::{Text, Timestamptz, Uuid as SqlUuid},
};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{models::SyncState, schema::sync_states};

pub const STATUS_IDLE: &str = "idle";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_ERROR: &str = "error";

pub const LEDGER_UNIQUE_INDEX: &str = "sync_states_tenant_kind_key";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncKind {
    Extensions,
    Conversations,
    Messages,
}

impl SyncKind {
    /// Extraction order within one cycle.
    pub const ALL: [SyncKind; 3] = [
        SyncKind::Extensions,
        SyncKind::Conversations,
        SyncKind::Messages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Extensions => "extensions",
            SyncKind::Conversations => "conversations",
            SyncKind::Messages => "messages",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SyncKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown sync kind: {value}"))
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{kind} sync already running for tenant {tenant_id}")]
    AlreadyRunning { tenant_id: Uuid, kind: SyncKind },
    #[error("{kind} sync for tenant {tenant_id} lost its ledger row to another run")]
    LeaseLost { tenant_id: Uuid, kind: SyncKind },
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Creates the `(tenant_id, sync_kind)` unique index if it is missing.
///
/// Rows that would violate it are collapsed first, keeping the most recently
/// updated row per pair (ties broken by id so the outcome is deterministic).
/// Returns the number of rows removed.
pub fn ensure_ledger_constraint(conn: &mut PgConnection) -> LedgerResult<usize> {
    conn.transaction(|conn| {
        conn.batch_execute("LOCK TABLE sync_states IN SHARE ROW EXCLUSIVE MODE")?;

        let removed = diesel::sql_query(
            "DELETE FROM sync_states s \
             USING ( \
                 SELECT id, ROW_NUMBER() OVER ( \
                     PARTITION BY tenant_id, sync_kind \
                     ORDER BY updated_at DESC, id DESC \
                 ) AS row_position \
                 FROM sync_states \
             ) ranked \
             WHERE s.id = ranked.id AND ranked.row_position > 1",
        )
        .execute(conn)?;

        conn.batch_execute(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {LEDGER_UNIQUE_INDEX} \
             ON sync_states (tenant_id, sync_kind)"
        ))?;

        if removed > 0 {
            warn!(removed, "removed duplicate sync ledger rows");
        }
        Ok(removed)
    })
}

/// Proof that one run holds `(tenant, kind)`.
///
/// Every write after [`begin`] is filtered on `run_id`, so a run whose row was
/// taken over after it stalled can no longer move the cursor or finish the row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub tenant_id: Uuid,
    pub kind: SyncKind,
    pub run_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct Acquired {
    pub lease: Lease,
    pub state: SyncState,
}

/// Moves `(tenant, kind)` to `running` under a fresh run token.
///
/// The insert races on the unique index: a concurrent or existing `running`
/// row makes the conflict branch's `WHERE` false, so nothing is returned and
/// the caller gets `AlreadyRunning`. A `running` row whose `updated_at`
/// heartbeat is older than `stale_before` is treated as abandoned and taken
/// over; a long run that keeps advancing is never stale.
pub fn begin(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    kind: SyncKind,
    stale_before: NaiveDateTime,
) -> LedgerResult<Acquired> {
    let run_id = Uuid::new_v4();
    let acquired = diesel::sql_query(
        "INSERT INTO sync_states \
             (id, tenant_id, sync_kind, status, run_id, last_started_at, created_at, updated_at) \
         VALUES ($1, $2, $3, 'running', $4, NOW(), NOW(), NOW()) \
         ON CONFLICT (tenant_id, sync_kind) DO UPDATE SET \
             status = 'running', \
             run_id = EXCLUDED.run_id, \
             last_started_at = NOW(), \
             updated_at = NOW() \
         WHERE sync_states.status <> 'running' \
            OR sync_states.updated_at < $5 \
         RETURNING *",
    )
    .bind::<SqlUuid, _>(Uuid::new_v4())
    .bind::<SqlUuid, _>(tenant_id)
    .bind::<Text, _>(kind.as_str())
    .bind::<SqlUuid, _>(run_id)
    .bind::<Timestamptz, _>(stale_before)
    .get_result::<SyncState>(conn)
    .optional()?;

    match acquired {
        Some(state) => Ok(Acquired {
            lease: Lease {
                tenant_id,
                kind,
                run_id,
            },
            state,
        }),
        None => Err(LedgerError::AlreadyRunning { tenant_id, kind }),
    }
}

pub fn stale_threshold(stale_after_minutes: i64) -> NaiveDateTime {
    (Utc::now() - ChronoDuration::minutes(stale_after_minutes)).naive_utc()
}

/// Rows still held by `lease`.
macro_rules! held_by {
    ($lease:expr) => {
        sync_states::table
            .filter(sync_states::tenant_id.eq($lease.tenant_id))
            .filter(sync_states::sync_kind.eq($lease.kind.as_str()))
            .filter(sync_states::status.eq(STATUS_RUNNING))
            .filter(sync_states::run_id.eq(Some($lease.run_id)))
    };
}

fn ensure_held(updated: usize, lease: &Lease) -> LedgerResult<()> {
    if updated == 0 {
        warn!(
            tenant_id = %lease.tenant_id,
            sync_kind = %lease.kind,
            run_id = %lease.run_id,
            "sync run no longer holds its ledger row"
        );
        return Err(LedgerError::LeaseLost {
            tenant_id: lease.tenant_id,
            kind: lease.kind,
        });
    }
    Ok(())
}

/// Advances the cursor while keeping the row `running`. Also the heartbeat.
pub fn advance(conn: &mut PgConnection, lease: &Lease, cursor: &Value) -> LedgerResult<()> {
    let updated = diesel::update(held_by!(lease))
        .set((
            sync_states::cursor.eq(Some(cursor.clone())),
            sync_states::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    ensure_held(updated, lease)
}

/// Refreshes the heartbeat of a run that has no cursor to move.
pub fn heartbeat(conn: &mut PgConnection, lease: &Lease) -> LedgerResult<()> {
    let updated = diesel::update(held_by!(lease))
        .set(sync_states::updated_at.eq(Utc::now().naive_utc()))
        .execute(conn)?;
    ensure_held(updated, lease)
}

pub fn commit(conn: &mut PgConnection, lease: &Lease, cursor: Option<&Value>) -> LedgerResult<()> {
    conn.transaction(|conn| {
        if let Some(cursor) = cursor {
            advance(conn, lease, cursor)?;
        }

        let now = Utc::now().naive_utc();
        let updated = diesel::update(held_by!(lease))
            .set((
                sync_states::status.eq(STATUS_IDLE),
                sync_states::run_id.eq::<Option<Uuid>>(None),
                sync_states::last_error.eq::<Option<String>>(None),
                sync_states::last_finished_at.eq(Some(now)),
                sync_states::last_success_at.eq(Some(now)),
                sync_states::updated_at.eq(now),
            ))
            .execute(conn)?;
        ensure_held(updated, lease)
    })
}

/// Records the failure; the cursor is left where the last full batch put it.
pub fn fail(conn: &mut PgConnection, lease: &Lease, error_message: &str) -> LedgerResult<()> {
    let now = Utc::now().naive_utc();
    let updated = diesel::update(held_by!(lease))
        .set((
            sync_states::status.eq(STATUS_ERROR),
            sync_states::run_id.eq::<Option<Uuid>>(None),
            sync_states::last_error.eq(Some(error_message.to_string())),
            sync_states::last_finished_at.eq(Some(now)),
            sync_states::updated_at.eq(now),
        ))
        .execute(conn)?;
    ensure_held(updated, lease)
}

/// Returns a held row to `idle` without touching cursor or error. A lease
/// that was already finished or taken over is left alone.
pub fn release(conn: &mut PgConnection, lease: &Lease) -> LedgerResult<bool> {
    let updated = diesel::update(held_by!(lease))
        .set((
            sync_states::status.eq(STATUS_IDLE),
            sync_states::run_id.eq::<Option<Uuid>>(None),
            sync_states::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(updated > 0)
}

/// Marks every kind of the tenant for an immediate run.
pub fn request_manual_run(conn: &mut PgConnection, tenant_id: Uuid) -> LedgerResult<usize> {
    let mut touched = 0;
    conn.transaction(|conn| {
        for kind in SyncKind::ALL {
            touched += diesel::sql_query(
                "INSERT INTO sync_states \
                     (id, tenant_id, sync_kind, status, trigger_requested_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, 'idle', NOW(), NOW(), NOW()) \
                 ON CONFLICT (tenant_id, sync_kind) DO UPDATE SET \
                     trigger_requested_at = NOW()",
            )
            .bind::<SqlUuid, _>(Uuid::new_v4())
            .bind::<SqlUuid, _>(tenant_id)
            .bind::<Text, _>(kind.as_str())
            .execute(conn)?;
        }
        Ok::<_, diesel::result::Error>(())
    })?;
    info!(tenant_id = %tenant_id, "manual sync requested");
    Ok(touched)
}

pub fn load_state(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    kind: SyncKind,
) -> LedgerResult<Option<SyncState>> {
    let state = sync_states::table
        .filter(sync_states::tenant_id.eq(tenant_id))
        .filter(sync_states::sync_kind.eq(kind.as_str()))
        .first(conn)
        .optional()?;
    Ok(state)
}

pub fn load_tenant_states(
    conn: &mut PgConnection,
    tenant_id: Uuid,
) -> LedgerResult<Vec<SyncState>> {
    let states = sync_states::table
        .filter(sync_states::tenant_id.eq(tenant_id))
        .order(sync_states::sync_kind.asc())
        .load(conn)?;
    Ok(states)
}

/// Whether a tenant should run now given its ledger rows.
///
/// A recent manual trigger that has not yet been picked up wins over the
/// interval; otherwise the oldest `last_started_at` across kinds decides.
pub fn is_due(
    states: &[SyncState],
    now: NaiveDateTime,
    interval: ChronoDuration,
    trigger_window: ChronoDuration,
) -> bool {
    if states.len() < SyncKind::ALL.len() {
        return true;
    }

    let triggered = states.iter().any(|state| match state.trigger_requested_at {
        Some(requested) => {
            now - requested <= trigger_window
                && state
                    .last_started_at
                    .map(|started| started < requested)
                    .unwrap_or(true)
        }
        None => false,
    });
    if triggered {
        return true;
    }

    states.iter().any(|state| match state.last_started_at {
        Some(started) => now - started >= interval,
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(
        kind: SyncKind,
        started: Option<NaiveDateTime>,
        trigger: Option<NaiveDateTime>,
    ) -> SyncState {
        let now = Utc::now().naive_utc();
        SyncState {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            sync_kind: kind.as_str().to_string(),
            status: STATUS_IDLE.to_string(),
            cursor: None,
            trigger_requested_at: trigger,
            last_error: None,
            last_started_at: started,
            last_finished_at: None,
            last_success_at: None,
            created_at: now,
            updated_at: now,
            run_id: None,
        }
    }

    #[test]
    fn sync_kind_parses_its_own_names() {
        for kind in SyncKind::ALL {
            assert_eq!(kind.as_str().parse::<SyncKind>().unwrap(), kind);
        }
        assert!("participants".parse::<SyncKind>().is_err());
    }

    #[test]
    fn tenant_without_full_ledger_is_due() {
        let now = Utc::now().naive_utc();
        let states = vec![state(SyncKind::Extensions, Some(now), None)];
        assert!(is_due(
            &states,
            now,
            ChronoDuration::minutes(15),
            ChronoDuration::minutes(60)
        ));
    }

    #[test]
    fn recent_run_is_not_due_until_interval_elapses() {
        let now = Utc::now().naive_utc();
        let started = now - ChronoDuration::minutes(5);
        let states: Vec<_> = SyncKind::ALL
            .into_iter()
            .map(|kind| state(kind, Some(started), None))
            .collect();

        assert!(!is_due(
            &states,
            now,
            ChronoDuration::minutes(15),
            ChronoDuration::minutes(60)
        ));
        assert!(is_due(
            &states,
            now + ChronoDuration::minutes(11),
            ChronoDuration::minutes(15),
            ChronoDuration::minutes(60)
        ));
    }

    #[test]
    fn manual_trigger_after_last_start_forces_a_run() {
        let now = Utc::now().naive_utc();
        let started = now - ChronoDuration::minutes(5);
        let mut states: Vec<_> = SyncKind::ALL
            .into_iter()
            .map(|kind| state(kind, Some(started), None))
            .collect();
        states[1].trigger_requested_at = Some(now - ChronoDuration::minutes(1));

        assert!(is_due(
            &states,
            now,
            ChronoDuration::minutes(15),
            ChronoDuration::minutes(60)
        ));
    }

    #[test]
    fn consumed_or_expired_trigger_is_ignored() {
        let now = Utc::now().naive_utc();
        let started = now - ChronoDuration::minutes(5);
        let mut states: Vec<_> = SyncKind::ALL
            .into_iter()
            .map(|kind| state(kind, Some(started), None))
            .collect();
        // Picked up by the run that started after it.
        states[0].trigger_requested_at = Some(started - ChronoDuration::minutes(1));
        assert!(!is_due(
            &states,
            now,
            ChronoDuration::minutes(15),
            ChronoDuration::minutes(60)
        ));

        states[0].last_started_at = Some(now - ChronoDuration::minutes(10));
        states[0].trigger_requested_at = Some(now - ChronoDuration::minutes(90));
        assert!(!is_due(
            &states,
            now,
            ChronoDuration::minutes(15),
            ChronoDuration::minutes(60)
        ));
    }
}
