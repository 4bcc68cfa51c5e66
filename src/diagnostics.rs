//! Step-by-step connectivity checks for one tenant.
//!
//! Each stage runs only if the previous one passed, so the first failure
//! names the layer at fault: the host does not resolve, the port does not
//! answer, the credentials are rejected, or the database is not what the
//! extractor expects.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::TunnelSettings,
    models::Tenant,
    remote::RemoteClient,
    tenants::{remote_database_url, ssh_endpoint, tunnel_params},
    tunnel::{connect_tcp, resolve, Tunnel, TunnelStage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
    pub duration_ms: u128,
}

impl CheckResult {
    fn pass(name: &'static str, message: impl Into<String>, started: Instant) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            message: message.into(),
            duration_ms: started.elapsed().as_millis(),
        }
    }

    fn fail(name: &'static str, message: impl Into<String>, started: Instant) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            message: message.into(),
            duration_ms: started.elapsed().as_millis(),
        }
    }

    fn skip(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Skip,
            message: "skipped after earlier failure".into(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub tenant_id: Uuid,
    pub checks: Vec<CheckResult>,
}

impl DiagnosticReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.status == CheckStatus::Pass)
    }

    pub fn first_failure(&self) -> Option<&CheckResult> {
        self.checks
            .iter()
            .find(|check| check.status == CheckStatus::Fail)
    }
}

pub const CHECKS: [&str; 5] = ["config", "dns", "tcp", "ssh_auth", "database"];

fn finish(tenant_id: Uuid, mut checks: Vec<CheckResult>) -> DiagnosticReport {
    for name in CHECKS.iter().copied().skip(checks.len()) {
        checks.push(CheckResult::skip(name));
    }
    let report = DiagnosticReport { tenant_id, checks };
    match report.first_failure() {
        Some(failed) => warn!(
            tenant_id = %tenant_id,
            check = failed.name,
            message = %failed.message,
            "tenant diagnostics failed"
        ),
        None => info!(tenant_id = %tenant_id, "tenant diagnostics passed"),
    }
    report
}

pub async fn diagnose(
    tenant: &Tenant,
    settings: &TunnelSettings,
    batch_size: i64,
) -> DiagnosticReport {
    let mut checks = Vec::with_capacity(CHECKS.len());

    // Missing credentials are reported at ssh_auth, after reachability, so a
    // host that resolves and listens is never blamed for them.
    let started = Instant::now();
    let (host, port) = match ssh_endpoint(tenant) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            checks.push(CheckResult::fail("config", err.to_string(), started));
            return finish(tenant.id, checks);
        }
    };
    let credentials = tunnel_params(tenant, settings);
    if let Err(err) = &credentials {
        if err.stage() == TunnelStage::Config {
            checks.push(CheckResult::fail("config", err.to_string(), started));
            return finish(tenant.id, checks);
        }
    }
    checks.push(CheckResult::pass(
        "config",
        format!("{}@{host}:{port}", tenant.ssh_user),
        started,
    ));

    let started = Instant::now();
    let addr = match resolve(&host, port, settings.connect_timeout).await {
        Ok(addr) => {
            checks.push(CheckResult::pass("dns", format!("{host} -> {addr}"), started));
            addr
        }
        Err(err) => {
            checks.push(CheckResult::fail("dns", err.to_string(), started));
            return finish(tenant.id, checks);
        }
    };

    let started = Instant::now();
    match connect_tcp(addr, &host, settings.connect_timeout).await {
        Ok(_) => checks.push(CheckResult::pass("tcp", format!("{addr} accepted"), started)),
        Err(err) => {
            checks.push(CheckResult::fail("tcp", err.to_string(), started));
            return finish(tenant.id, checks);
        }
    }

    let started = Instant::now();
    let opened = match credentials {
        Ok(params) => Tunnel::open(&params).await,
        Err(err) => Err(err),
    };
    let tunnel = match opened {
        Ok(tunnel) => {
            checks.push(CheckResult::pass(
                "ssh_auth",
                format!("authenticated as {}", tenant.ssh_user),
                started,
            ));
            tunnel
        }
        Err(err) => {
            checks.push(CheckResult::fail(
                "ssh_auth",
                format!("[{}] {err}", err.stage()),
                started,
            ));
            return finish(tenant.id, checks);
        }
    };

    let started = Instant::now();
    checks.push(database_check(tenant, &tunnel, settings, batch_size, started).await);
    tunnel.close().await;
    finish(tenant.id, checks)
}

async fn database_check(
    tenant: &Tenant,
    tunnel: &Tunnel,
    settings: &TunnelSettings,
    batch_size: i64,
    started: Instant,
) -> CheckResult {
    let url = match remote_database_url(tenant, tunnel.local_port()) {
        Ok(url) => url,
        Err(err) => return CheckResult::fail("database", err.to_string(), started),
    };
    let client = match RemoteClient::connect(url, settings.statement_timeout, batch_size).await {
        Ok(client) => client,
        Err(err) => return CheckResult::fail("database", err.to_string(), started),
    };
    if let Err(err) = client.ping().await {
        return CheckResult::fail("database", err.to_string(), started);
    }
    match client.probe_schema().await {
        Ok(relations) => {
            let missing: Vec<&str> = relations
                .iter()
                .filter(|(_, present)| !present)
                .map(|(name, _)| *name)
                .collect();
            if missing.is_empty() {
                CheckResult::pass(
                    "database",
                    format!("query ok, {} relations present", relations.len()),
                    started,
                )
            } else {
                CheckResult::fail(
                    "database",
                    format!("missing relations: {}", missing.join(", ")),
                    started,
                )
            }
        }
        Err(err) => CheckResult::fail("database", err.to_string(), started),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn tenant(host: &str, port: i32) -> Tenant {
        let now = Utc::now().naive_utc();
        Tenant {
            id: Uuid::new_v4(),
            name: "Diag".into(),
            ssh_host: host.into(),
            ssh_port: port,
            ssh_user: "backup".into(),
            ssh_password: Some("secret".into()),
            ssh_private_key: None,
            ssh_host_fingerprint: None,
            db_host: "127.0.0.1".into(),
            db_port: 5432,
            db_name: "pbx".into(),
            db_user: "pbx".into(),
            db_password: "pbx".into(),
            sync_enabled: true,
            sync_interval_minutes: None,
            default_storage_backend: "s3".into(),
            last_sync_at: None,
            last_activity_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn unresolvable_host_fails_dns_and_skips_the_rest() {
        let report = diagnose(&tenant("pbx.invalid", 22), &TunnelSettings::default(), 10).await;

        let statuses: Vec<_> = report.checks.iter().map(|c| (c.name, c.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("config", CheckStatus::Pass),
                ("dns", CheckStatus::Fail),
                ("tcp", CheckStatus::Skip),
                ("ssh_auth", CheckStatus::Skip),
                ("database", CheckStatus::Skip),
            ]
        );
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn closed_port_fails_tcp() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let report = diagnose(
            &tenant("127.0.0.1", i32::from(port)),
            &TunnelSettings::default(),
            10,
        )
        .await;

        assert_eq!(report.checks[1].status, CheckStatus::Pass);
        assert_eq!(report.first_failure().map(|c| c.name), Some("tcp"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_ssh_auth_not_dns() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut tenant = tenant("127.0.0.1", i32::from(port));
        tenant.ssh_password = None;

        let report = diagnose(&tenant, &TunnelSettings::default(), 10).await;

        let statuses: Vec<_> = report.checks.iter().map(|c| (c.name, c.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("config", CheckStatus::Pass),
                ("dns", CheckStatus::Pass),
                ("tcp", CheckStatus::Pass),
                ("ssh_auth", CheckStatus::Fail),
                ("database", CheckStatus::Skip),
            ]
        );
        let failure = report.first_failure().unwrap();
        assert!(failure.message.contains("no ssh credentials"), "{}", failure.message);
        drop(listener);
    }

    #[tokio::test]
    async fn unusable_port_fails_config() {
        let report = diagnose(&tenant("127.0.0.1", 0), &TunnelSettings::default(), 10).await;
        assert_eq!(report.first_failure().map(|c| c.name), Some("config"));
        assert!(report.checks[1..].iter().all(|c| c.status == CheckStatus::Skip));
    }

    #[test]
    fn report_serialises_statuses_in_lowercase() {
        let report = finish(Uuid::nil(), vec![]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["checks"][0]["status"], "skip");
        assert_eq!(json["checks"].as_array().unwrap().len(), 5);
    }
}
