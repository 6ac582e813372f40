//! Tenant isolation for business data.
//!
//! Business code never talks to a [`DataBackend`] directly. It opens a
//! [`TenantSession`] from a [`Database`], and every create/read/update/delete
//! issued through that session passes a [`TenantInterceptor`] first. The
//! interceptor works on structured clauses ([`Filter::Tenant`]) that only it
//! can construct, so isolation never depends on inspecting generated SQL.
//!
//! Sessions are plain values owned by one request. There is no ambient
//! "current tenant" anywhere in the process.

pub mod backend;
pub mod interceptor;
pub mod postgres;
pub mod query;
pub mod schema;
pub mod session;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::models::TenantId;

pub use backend::{DataBackend, MemoryBackend};
pub use interceptor::{QueryInterceptor, TenantInterceptor};
pub use postgres::PgBackend;
pub use query::{Delete, Filter, Include, Insert, Order, Query, Record, TenantPredicate, Update};
pub use schema::{Association, AssociationKind, Schema, TableDef, business_schema};
pub use session::{BypassGrant, Bypassed, Database, TenantSession};

/// Column every tenant-scoped table carries.
pub const TENANT_COLUMN: &str = "tenant_id";

/// Primary key column of every table.
pub const ID_COLUMN: &str = "id";

/// How to treat a tenant-scoped operation issued without a tenant bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// Fail with `TENANT_CONTEXT_REQUIRED`. Production setting.
    #[default]
    Strict,
    /// Log a warning and run unfiltered. Local diagnostics only.
    Permissive,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::Strict => "strict",
            IsolationMode::Permissive => "permissive",
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(IsolationMode::Strict),
            "permissive" => Ok(IsolationMode::Permissive),
            other => Err(format!(
                "unknown isolation mode '{other}' (expected strict or permissive)"
            )),
        }
    }
}

/// Tenant isolation errors. None of these are retried.
#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("Tenant context required for '{table}'")]
    ContextRequired { table: String },

    #[error("Record for '{table}' belongs to tenant {payload}, session is bound to {session}")]
    TenantMismatch {
        table: String,
        session: TenantId,
        payload: String,
    },

    #[error("tenant_id of '{table}' rows cannot be changed")]
    TenantIdImmutable { table: String },

    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    #[error("Unknown association '{association}' on '{table}'")]
    UnknownAssociation { table: String, association: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Database error: {0}")]
    Backend(#[from] sqlx::Error),
}

impl TenancyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TenancyError::ContextRequired { .. } => ErrorKind::TenantContextRequired,
            TenancyError::TenantMismatch { .. } | TenancyError::TenantIdImmutable { .. } => {
                ErrorKind::Forbidden
            }
            TenancyError::UnknownTable(_) | TenancyError::UnknownAssociation { .. } => {
                ErrorKind::NotFound
            }
            TenancyError::InvalidRecord(_) => ErrorKind::Validation,
            TenancyError::Backend(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests;
