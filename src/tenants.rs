use chrono::{NaiveDateTime, Utc};
use diesel::{pg::PgConnection, prelude::*};
use url::Url;
use uuid::Uuid;

use crate::{
    config::TunnelSettings,
    error::{SyncError, SyncResult},
    models::Tenant,
    schema::tenants,
    tunnel::{SshAuth, TunnelError, TunnelParams},
};

pub fn load_tenant(conn: &mut PgConnection, tenant_id: Uuid) -> SyncResult<Option<Tenant>> {
    let tenant = tenants::table.find(tenant_id).first(conn).optional()?;
    Ok(tenant)
}

pub fn load_sync_enabled(conn: &mut PgConnection) -> SyncResult<Vec<Tenant>> {
    let rows = tenants::table
        .filter(tenants::sync_enabled.eq(true))
        .order(tenants::last_sync_at.asc())
        .load(conn)?;
    Ok(rows)
}

pub fn load_all(conn: &mut PgConnection) -> SyncResult<Vec<Tenant>> {
    let rows = tenants::table.order(tenants::name.asc()).load(conn)?;
    Ok(rows)
}

/// Records a finished cycle, and the newest message it saw if any.
pub fn touch_sync(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    latest_activity: Option<NaiveDateTime>,
) -> SyncResult<()> {
    let now = Utc::now().naive_utc();
    diesel::update(tenants::table.find(tenant_id))
        .set((tenants::last_sync_at.eq(Some(now)), tenants::updated_at.eq(now)))
        .execute(conn)?;

    if let Some(activity) = latest_activity {
        // Never move last_activity_at backwards.
        diesel::update(
            tenants::table.find(tenant_id).filter(
                tenants::last_activity_at
                    .is_null()
                    .or(tenants::last_activity_at.lt(activity)),
            ),
        )
        .set(tenants::last_activity_at.eq(Some(activity)))
        .execute(conn)?;
    }
    Ok(())
}

pub fn sync_interval_minutes(tenant: &Tenant, default_minutes: i64) -> i64 {
    tenant
        .sync_interval_minutes
        .filter(|minutes| *minutes > 0)
        .map(i64::from)
        .unwrap_or(default_minutes)
}

/// Host and port of the tenant's SSH daemon.
pub fn ssh_endpoint(tenant: &Tenant) -> Result<(String, u16), TunnelError> {
    Ok((tenant.ssh_host.clone(), port(tenant.ssh_port, "ssh_port")?))
}

/// A private key wins over a password; a stored password then unlocks the key.
pub fn ssh_auth(tenant: &Tenant) -> Result<SshAuth, TunnelError> {
    match (&tenant.ssh_private_key, &tenant.ssh_password) {
        (Some(pem), passphrase) if !pem.trim().is_empty() => Ok(SshAuth::PrivateKey {
            pem: pem.clone(),
            passphrase: passphrase.clone(),
        }),
        (_, Some(password)) if !password.is_empty() => Ok(SshAuth::Password(password.clone())),
        _ => Err(TunnelError::MissingCredentials {
            host: tenant.ssh_host.clone(),
            user: tenant.ssh_user.clone(),
        }),
    }
}

pub fn tunnel_params(
    tenant: &Tenant,
    settings: &TunnelSettings,
) -> Result<TunnelParams, TunnelError> {
    let (ssh_host, ssh_port) = ssh_endpoint(tenant)?;
    Ok(TunnelParams {
        ssh_host,
        ssh_port,
        ssh_user: tenant.ssh_user.clone(),
        auth: ssh_auth(tenant)?,
        host_fingerprint: tenant
            .ssh_host_fingerprint
            .clone()
            .filter(|value| !value.trim().is_empty()),
        remote_host: tenant.db_host.clone(),
        remote_port: port(tenant.db_port, "db_port")?,
        connect_timeout: settings.connect_timeout,
        inactivity_timeout: settings.inactivity_timeout,
    })
}

fn port(value: i32, field: &'static str) -> Result<u16, TunnelError> {
    u16::try_from(value)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| TunnelError::InvalidParameter {
            field,
            reason: format!("{value} is not a usable port"),
        })
}

/// Connection string for the tenant database as reached through a tunnel.
pub fn remote_database_url(tenant: &Tenant, local_port: u16) -> SyncResult<String> {
    let mut url = Url::parse("postgres://127.0.0.1")
        .map_err(|err| SyncError::SourceQuery(err.to_string()))?;
    let invalid = |_| SyncError::SourceQuery("invalid remote database credentials".into());
    url.set_port(Some(local_port)).map_err(invalid)?;
    url.set_username(&tenant.db_user).map_err(invalid)?;
    url.set_password(Some(&tenant.db_password)).map_err(invalid)?;
    url.set_path(&tenant.db_name);
    url.query_pairs_mut()
        .append_pair("sslmode", "disable")
        .append_pair("application_name", "pbx-archiver");
    Ok(url.to_string())
}
