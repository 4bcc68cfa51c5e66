use anyhow::Context;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use pbx_archiver::{
    config::EngineConfig,
    db, ledger,
    state::{build_storage, EngineState},
    Scheduler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = EngineConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        max_concurrent_tenants = config.sync.max_concurrent_tenants,
        s3_enabled = config.s3_bucket.is_some(),
        supabase_enabled = config.supabase_url.is_some(),
        "loaded engine configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;

    {
        let mut conn = pool.get().context("failed to get database connection")?;
        db::run_migrations(&mut conn)?;
        ledger::ensure_ledger_constraint(&mut conn)?;
    }

    let storage = build_storage(&config).await?;
    let state = EngineState::new(pool, config, storage);
    let scheduler = Scheduler::new(state);

    let shutdown = scheduler.shutdown_token();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("worker received shutdown signal; draining sync cycles");
                shutdown.cancel();
            }
            Err(err) => tracing::error!(error = %err, "failed to listen for shutdown signal"),
        }
    });

    scheduler.run().await;
    tracing::info!("worker stopped");
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
