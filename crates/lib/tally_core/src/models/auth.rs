//! Identity models: users, tenant memberships, roles and capabilities.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tenant::{Tenant, TenantId};

/// Global user identity. Independent of any tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

/// User plus stored password hash (for internal auth flows only).
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user: User,
    pub password_hash: String,
}

/// Input for creating a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Normalised (trimmed, lowercased) email.
    pub email: String,
    pub password_hash: String,
}

/// Role a user holds inside one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Finance,
    Sales,
    Warehouse,
    Staff,
}

/// Something a role may be allowed to do inside its tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    View,
    Create,
    Edit,
    Delete,
    Approve,
    ManageUsers,
    ViewReports,
    ManageSettings,
}

use Capability::*;

const OWNER_CAPS: &[Capability] = &[
    View,
    Create,
    Edit,
    Delete,
    Approve,
    ManageUsers,
    ViewReports,
    ManageSettings,
];
const ADMIN_CAPS: &[Capability] = &[View, Create, Edit, Delete, Approve, ManageUsers, ViewReports];
const FINANCE_CAPS: &[Capability] = &[View, Create, Edit, Approve, ViewReports];
const SALES_CAPS: &[Capability] = &[View, Create, Edit];
const WAREHOUSE_CAPS: &[Capability] = &[View, Create, Edit];
const STAFF_CAPS: &[Capability] = &[View];

impl Role {
    /// Database text representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Finance => "finance",
            Role::Sales => "sales",
            Role::Warehouse => "warehouse",
            Role::Staff => "staff",
        }
    }

    /// The full capability set granted to this role.
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Role::Owner => OWNER_CAPS,
            Role::Admin => ADMIN_CAPS,
            Role::Finance => FINANCE_CAPS,
            Role::Sales => SALES_CAPS,
            Role::Warehouse => WAREHOUSE_CAPS,
            Role::Staff => STAFF_CAPS,
        }
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "finance" => Ok(Role::Finance),
            "sales" => Ok(Role::Sales),
            "warehouse" => Ok(Role::Warehouse),
            "staff" => Ok(Role::Staff),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// User × Tenant join row; token claims are derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: Uuid,
    pub tenant_id: TenantId,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A membership joined with its tenant, as listed by `/auth/me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantAccess {
    pub tenant: Tenant,
    pub role: Role,
    pub membership_active: bool,
}

impl TenantAccess {
    /// Active membership in a tenant whose status permits access.
    pub fn is_usable(&self) -> bool {
        self.membership_active && self.tenant.status.permits_access()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ROLES: [Role; 6] = [
        Role::Owner,
        Role::Admin,
        Role::Finance,
        Role::Sales,
        Role::Warehouse,
        Role::Staff,
    ];

    #[test]
    fn owner_holds_every_capability() {
        for cap in OWNER_CAPS {
            assert!(Role::Owner.can(*cap));
        }
        assert_eq!(OWNER_CAPS.len(), 8);
    }

    #[test]
    fn every_role_can_view() {
        for role in ALL_ROLES {
            assert!(role.can(Capability::View), "{role} cannot view");
        }
    }

    #[test]
    fn only_owner_manages_settings() {
        for role in ALL_ROLES {
            assert_eq!(role.can(Capability::ManageSettings), role == Role::Owner);
        }
    }

    #[test]
    fn staff_is_read_only() {
        assert!(!Role::Staff.can(Capability::Create));
        assert!(!Role::Staff.can(Capability::Edit));
        assert!(!Role::Staff.can(Capability::Delete));
    }

    #[test]
    fn finance_approves_but_sales_does_not() {
        assert!(Role::Finance.can(Capability::Approve));
        assert!(!Role::Sales.can(Capability::Approve));
    }

    #[test]
    fn role_text_form_roundtrips() {
        for role in ALL_ROLES {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("root".parse::<Role>().is_err());
    }
}
