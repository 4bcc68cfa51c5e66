use thiserror::Error;
use uuid::Uuid;

use crate::{
    ledger::{LedgerError, SyncKind},
    tunnel::TunnelError,
};

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// DNS, TCP or shell-authentication failure. Never retried inside a cycle.
    #[error("connectivity failure: {0}")]
    Connectivity(#[from] TunnelError),

    /// The remote schema is missing an object or a query was rejected.
    #[error("remote query failed: {0}")]
    SourceQuery(String),

    /// Another run holds, or has taken over, the ledger row.
    #[error("{kind} sync for tenant {tenant_id} is held by another run")]
    Conflict { tenant_id: Uuid, kind: SyncKind },

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("database pool error: {0}")]
    Pool(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn source_query(err: impl std::fmt::Display) -> Self {
        Self::SourceQuery(err.to_string())
    }

    pub fn merge(err: impl std::fmt::Display) -> Self {
        Self::Merge(err.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for SyncError {
    fn from(value: diesel::r2d2::PoolError) -> Self {
        SyncError::Pool(value.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(value: tokio::task::JoinError) -> Self {
        SyncError::Task(value.to_string())
    }
}

impl From<LedgerError> for SyncError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::AlreadyRunning { tenant_id, kind }
            | LedgerError::LeaseLost { tenant_id, kind } => SyncError::Conflict { tenant_id, kind },
            LedgerError::Database(err) => SyncError::Database(err),
        }
    }
}
