//! Tenant identity and lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque tenant identifier.
///
/// A newtype so a tenant id can never be confused with a user or row id when
/// it is threaded through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Fresh, time-ordered tenant id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Tenant lifecycle status. Mutated by billing/admin flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Trial,
    Active,
    Suspended,
    Expired,
}

impl TenantStatus {
    /// Database text representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Trial => "trial",
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Expired => "expired",
        }
    }

    /// Whether members may sign in to (or switch into) the tenant.
    pub fn permits_access(&self) -> bool {
        matches!(self, TenantStatus::Trial | TenantStatus::Active)
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(TenantStatus::Trial),
            "active" => Ok(TenantStatus::Active),
            "suspended" => Ok(TenantStatus::Suspended),
            "expired" => Ok(TenantStatus::Expired),
            other => Err(format!("unknown tenant status '{other}'")),
        }
    }
}

/// A tenant (customer organisation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a tenant at signup.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_trial_and_active_permit_access() {
        assert!(TenantStatus::Trial.permits_access());
        assert!(TenantStatus::Active.permits_access());
        assert!(!TenantStatus::Suspended.permits_access());
        assert!(!TenantStatus::Expired.permits_access());
    }

    #[test]
    fn status_parses_its_own_text_form() {
        for status in [
            TenantStatus::Trial,
            TenantStatus::Active,
            TenantStatus::Suspended,
            TenantStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<TenantStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<TenantStatus>().is_err());
    }

    #[test]
    fn tenant_id_serializes_as_bare_uuid() {
        let id = TenantId::generate();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }
}
