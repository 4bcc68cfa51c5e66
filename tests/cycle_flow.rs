mod common;

use std::time::Duration;

use anyhow::Result;
use common::{acquire_db_lock, TestContext};
use diesel::prelude::*;
use pbx_archiver::ledger::{self, SyncKind};
use pbx_archiver::models::Tenant;
use pbx_archiver::schema::tenants;
use pbx_archiver::{run_cycle, CycleOutcome, Scheduler};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn load_tenant(ctx: &TestContext, tenant_id: Uuid) -> Result<Tenant> {
    ctx.with_conn(move |conn| Ok(tenants::table.find(tenant_id).first::<Tenant>(conn)?))
        .await
}

#[tokio::test]
async fn unreachable_host_fails_every_kind_with_dns_error() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let tenant_id = ctx.insert_tenant("Unreachable").await?;
    let tenant = load_tenant(&ctx, tenant_id).await?;

    let report = run_cycle(&ctx.state, &tenant, &CancellationToken::new()).await;
    match &report.outcome {
        CycleOutcome::Failed { kind, error } => {
            assert_eq!(*kind, None);
            assert!(error.contains("could not resolve pbx.invalid"), "{error}");
        }
        other => panic!("expected failure, got {other}"),
    }
    assert_eq!(report.batches, 0);

    let states = ctx
        .with_conn(move |conn| Ok(ledger::load_tenant_states(conn, tenant_id)?))
        .await?;
    assert_eq!(states.len(), SyncKind::ALL.len());
    for state in &states {
        assert_eq!(state.status, ledger::STATUS_ERROR);
        assert!(state.cursor.is_none());
        assert!(state
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("could not resolve")));
    }

    // A failed cycle is not retried before its interval elapses.
    let tenant_after = load_tenant(&ctx, tenant_id).await?;
    assert!(tenant_after.last_sync_at.is_none());
    let due = Scheduler::new(ctx.state.clone()).due_tenants().await?;
    assert!(due.iter().all(|t| t.id != tenant_id));
    Ok(())
}

#[tokio::test]
async fn cycle_is_skipped_while_another_run_holds_the_ledger() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let tenant_id = ctx.insert_tenant("Busy").await?;
    let tenant = load_tenant(&ctx, tenant_id).await?;

    ctx.with_conn(move |conn| {
        ledger::begin(conn, tenant_id, SyncKind::Messages, ledger::stale_threshold(120))?;
        Ok(())
    })
    .await?;

    let report = run_cycle(&ctx.state, &tenant, &CancellationToken::new()).await;
    assert_eq!(report.outcome, CycleOutcome::Skipped);

    // The kinds acquired before the conflict were handed back.
    let states = ctx
        .with_conn(move |conn| Ok(ledger::load_tenant_states(conn, tenant_id)?))
        .await?;
    for state in states {
        let expected = if state.sync_kind == SyncKind::Messages.as_str() {
            ledger::STATUS_RUNNING
        } else {
            ledger::STATUS_IDLE
        };
        assert_eq!(state.status, expected, "{}", state.sync_kind);
    }
    Ok(())
}

#[tokio::test]
async fn scheduler_picks_new_and_triggered_tenants_only() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let fresh = ctx.insert_tenant("Fresh").await?;
    let synced = ctx.insert_tenant("Synced").await?;
    let disabled = ctx.insert_tenant("Disabled").await?;

    ctx.with_conn(move |conn| {
        for kind in SyncKind::ALL {
            let run = ledger::begin(conn, synced, kind, ledger::stale_threshold(120))?;
            ledger::commit(conn, &run.lease, None)?;
        }
        diesel::update(tenants::table.find(disabled))
            .set(tenants::sync_enabled.eq(false))
            .execute(conn)?;
        Ok(())
    })
    .await?;

    let scheduler = Scheduler::new(ctx.state.clone());
    let due: Vec<Uuid> = scheduler.due_tenants().await?.iter().map(|t| t.id).collect();
    assert_eq!(due, vec![fresh]);

    ctx.with_conn(move |conn| Ok(ledger::request_manual_run(conn, synced)?))
        .await?;
    let mut due: Vec<Uuid> = scheduler.due_tenants().await?.iter().map(|t| t.id).collect();
    due.sort();
    let mut expected = vec![fresh, synced];
    expected.sort();
    assert_eq!(due, expected);
    Ok(())
}

#[tokio::test]
async fn shutdown_mid_cycle_hands_rows_back_idle() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let tenant_id = ctx.insert_tenant("Interrupted").await?;

    // Accepts the ssh connection and never answers, so the handshake hangs.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    ctx.with_conn(move |conn| {
        diesel::update(tenants::table.find(tenant_id))
            .set((
                tenants::ssh_host.eq("127.0.0.1"),
                tenants::ssh_port.eq(i32::from(port)),
            ))
            .execute(conn)?;
        Ok(())
    })
    .await?;
    let tenant = load_tenant(&ctx, tenant_id).await?;

    let shutdown = CancellationToken::new();
    let cycle = {
        let state = ctx.state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_cycle(&state, &tenant, &shutdown).await })
    };

    let mut running = false;
    for _ in 0..100 {
        let states = ctx
            .with_conn(move |conn| Ok(ledger::load_tenant_states(conn, tenant_id)?))
            .await?;
        if states.len() == SyncKind::ALL.len()
            && states.iter().all(|state| state.status == ledger::STATUS_RUNNING)
        {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(running, "cycle never acquired its ledger rows");

    shutdown.cancel();
    let report = cycle.await?;
    assert_eq!(report.outcome, CycleOutcome::Cancelled);
    silent.abort();

    let states = ctx
        .with_conn(move |conn| Ok(ledger::load_tenant_states(conn, tenant_id)?))
        .await?;
    assert_eq!(states.len(), SyncKind::ALL.len());
    for state in &states {
        assert_eq!(state.status, ledger::STATUS_IDLE, "{}", state.sync_kind);
        assert!(state.last_error.is_none());
        assert!(state.run_id.is_none());
    }

    // Cancellation is not a sync, so the tenant stays due.
    let tenant_after = load_tenant(&ctx, tenant_id).await?;
    assert!(tenant_after.last_sync_at.is_none());
    Ok(())
}
