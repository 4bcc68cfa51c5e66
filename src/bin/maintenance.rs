use std::{env, path::PathBuf, str::FromStr, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pbx_archiver::{
    compression::{self, CompressionOptions, CompressionPipeline, MediaTranscoder},
    config::EngineConfig,
    db, diagnostics, ledger, linker,
    models::Tenant,
    run_cycle,
    state::{build_storage, EngineState},
    storage::StorageBackend,
    tenants,
};

const USAGE: &str = "Usage: maintenance <command>

Commands:
  status                                   ledger and orphan summary per tenant
  diagnose <tenant>                        connectivity checks, printed as JSON
  trigger <tenant>                         request an immediate sync
  sync-once <tenant>                       run one sync cycle now
  link-media <tenant>                      register storage orphans and link them
  compress [--dry-run] [--tenant <id>] [--limit <n>]
  backup <dir> [--tenant <id>]             copy originals into a manifest set
  restore <manifest>                       put backed-up originals back
  ensure-ledger                            deduplicate and index the sync ledger";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "status" => status().await?,
        "diagnose" => diagnose(tenant_arg(&rest)?).await?,
        "trigger" => trigger(tenant_arg(&rest)?).await?,
        "sync-once" => sync_once(tenant_arg(&rest)?).await?,
        "link-media" => link_media(tenant_arg(&rest)?).await?,
        "compress" => compress(parse_compress_args(&rest)?).await?,
        "backup" => {
            let dir = rest.first().ok_or_else(|| anyhow!("backup needs a directory"))?;
            let tenant = flag_value::<Uuid>(&rest, "--tenant")?;
            backup(PathBuf::from(dir), tenant).await?
        }
        "restore" => {
            let manifest = rest.first().ok_or_else(|| anyhow!("restore needs a manifest path"))?;
            restore(PathBuf::from(manifest)).await?
        }
        "ensure-ledger" => ensure_ledger().await?,
        other => {
            eprintln!("Unknown command: {other}\n{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn tenant_arg(rest: &[String]) -> Result<Uuid> {
    let raw = rest.first().ok_or_else(|| anyhow!("missing tenant id"))?;
    Uuid::parse_str(raw).with_context(|| format!("invalid tenant id: {raw}"))
}

fn flag_value<T>(rest: &[String], flag: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(position) = rest.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    let raw = rest
        .get(position + 1)
        .ok_or_else(|| anyhow!("{flag} needs a value"))?;
    raw.parse()
        .map(Some)
        .map_err(|err| anyhow!("invalid value for {flag}: {err}"))
}

fn parse_compress_args(rest: &[String]) -> Result<CompressionOptions> {
    Ok(CompressionOptions {
        dry_run: rest.iter().any(|arg| arg == "--dry-run"),
        tenant_id: flag_value(rest, "--tenant")?,
        limit: flag_value(rest, "--limit")?,
    })
}

async fn engine_state() -> Result<EngineState> {
    let config = EngineConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        "loaded engine configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    {
        let mut conn = pool.get().context("failed to get database connection")?;
        db::run_migrations(&mut conn)?;
        ledger::ensure_ledger_constraint(&mut conn)?;
    }
    let storage = build_storage(&config).await?;
    Ok(EngineState::new(pool, config, storage))
}

async fn find_tenant(state: &EngineState, tenant_id: Uuid) -> Result<Tenant> {
    state
        .with_db(move |conn| tenants::load_tenant(conn, tenant_id))
        .await?
        .ok_or_else(|| anyhow!("tenant {tenant_id} not found"))
}

async fn status() -> Result<()> {
    let state = engine_state().await?;
    let (all, orphans) = state
        .with_db(|conn| {
            let mut rows = Vec::new();
            for tenant in tenants::load_all(conn)? {
                let states = ledger::load_tenant_states(conn, tenant.id)?;
                rows.push((tenant, states));
            }
            Ok((rows, linker::orphan_counts(conn)?))
        })
        .await?;

    if all.is_empty() {
        println!("No tenants found.");
        return Ok(());
    }
    for (tenant, states) in all {
        println!(
            "{} {} enabled={} last_sync={} orphans={}",
            tenant.id,
            tenant.name,
            tenant.sync_enabled,
            tenant
                .last_sync_at
                .map(|at| at.to_string())
                .unwrap_or_else(|| "never".into()),
            orphans.get(&tenant.id).copied().unwrap_or(0)
        );
        for row in states {
            println!(
                "  {:<14} {:<8} {}",
                row.sync_kind,
                row.status,
                row.last_error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

async fn diagnose(tenant_id: Uuid) -> Result<()> {
    let state = engine_state().await?;
    let tenant = find_tenant(&state, tenant_id).await?;
    let report =
        diagnostics::diagnose(&tenant, &state.config.tunnel, state.config.sync.batch_size).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed() {
        std::process::exit(2);
    }
    Ok(())
}

async fn trigger(tenant_id: Uuid) -> Result<()> {
    let state = engine_state().await?;
    find_tenant(&state, tenant_id).await?;
    let touched = state
        .with_db(move |conn| Ok(ledger::request_manual_run(conn, tenant_id)?))
        .await?;
    println!("Manual sync requested for {tenant_id} ({touched} ledger rows).");
    Ok(())
}

async fn sync_once(tenant_id: Uuid) -> Result<()> {
    let state = engine_state().await?;
    let tenant = find_tenant(&state, tenant_id).await?;
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });
    let report = run_cycle(&state, &tenant, &shutdown).await;
    println!(
        "{}: {} (conversations {}, participants {}, messages {}, linked {}/{})",
        tenant.name,
        report.outcome,
        report.conversations.touched(),
        report.participants.touched(),
        report.messages.touched(),
        report.links.linked,
        report.links.examined,
    );
    Ok(())
}

async fn link_media(tenant_id: Uuid) -> Result<()> {
    let state = engine_state().await?;
    let tenant = find_tenant(&state, tenant_id).await?;
    let backend = StorageBackend::from_str(&tenant.default_storage_backend)?;

    let discovered = linker::discover_orphans(&state, tenant_id, backend).await?;
    let window = state.config.linker_recent_window;
    let report = state
        .with_db(move |conn| linker::link_orphans(conn, tenant_id, window))
        .await?;
    println!(
        "Registered {discovered} new objects; linked {} of {} orphans ({} left unlinked).",
        report.linked, report.examined, report.unlinked
    );
    Ok(())
}

async fn compress(options: CompressionOptions) -> Result<()> {
    let state = engine_state().await?;
    let transcoder = Arc::new(MediaTranscoder::new(state.config.compression.clone()));
    let pipeline = CompressionPipeline::new(state, transcoder);
    let report = pipeline.run(&options).await?;

    let label = if options.dry_run { "Estimated" } else { "Saved" };
    println!(
        "Examined {}, compressed {}, skipped {}, failed {}. {label} {} bytes.",
        report.examined,
        report.compressed,
        report.skipped,
        report.failed,
        report.saved_bytes()
    );
    if let Some(manifest) = report.manifest {
        println!("Backup manifest: {}", manifest.display());
    }
    Ok(())
}

async fn backup(dir: PathBuf, tenant_id: Option<Uuid>) -> Result<()> {
    let state = engine_state().await?;
    let writer = compression::backup_inventory(&state, &dir, tenant_id).await?;
    println!(
        "Backed up {} files to {}",
        writer.entries(),
        writer.manifest_path().display()
    );
    Ok(())
}

async fn restore(manifest: PathBuf) -> Result<()> {
    if !manifest.is_file() {
        bail!("manifest {} does not exist", manifest.display());
    }
    let state = engine_state().await?;
    let report = compression::restore(&state, &manifest).await?;
    println!(
        "Restored {}, missing {}, failed {}.",
        report.restored, report.missing, report.failed
    );
    if report.failed > 0 {
        std::process::exit(2);
    }
    Ok(())
}

async fn ensure_ledger() -> Result<()> {
    let config = EngineConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;
    db::run_migrations(&mut conn)?;
    let removed = ledger::ensure_ledger_constraint(&mut conn)?;
    println!("Sync ledger constraint in place ({removed} duplicate rows removed).");
    Ok(())
}
