use std::time::Duration;

use anyhow::{anyhow, Context};
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 8;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Tags every pooled session so archive traffic is identifiable in `pg_stat_activity`.
#[derive(Debug)]
struct SessionSetup;

impl CustomizeConnection<PgConnection, r2d2::Error> for SessionSetup {
    fn on_acquire(&self, conn: &mut PgConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute("SET application_name = 'pbx-archiver'")
            .map_err(r2d2::Error::QueryError)
    }
}

pub fn init_pool_with_size(database_url: &str, max_size: u32) -> anyhow::Result<PgPool> {
    Pool::builder()
        .max_size(max_size.max(1))
        .connection_timeout(Duration::from_secs(10))
        .connection_customizer(Box::new(SessionSetup))
        .build(ConnectionManager::<PgConnection>::new(database_url))
        .context("failed to build central database pool")
}

pub fn run_migrations(conn: &mut PgConnection) -> anyhow::Result<()> {
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
    Ok(())
}
