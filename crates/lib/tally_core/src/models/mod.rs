//! Domain models.
//!
//! Internal domain types shared by the stores, the auth primitives and the API
//! layer (which defines its own camelCase request/response shapes).

pub mod auth;
pub mod tenant;
pub mod token;

pub use auth::{Capability, Membership, NewUser, Role, TenantAccess, User, UserCredentials};
pub use tenant::{NewTenant, Tenant, TenantId, TenantStatus};
pub use token::{
    FailureWindow, LoginAttempt, NewOneTimeToken, NewRefreshToken, OneTimePurpose,
    OneTimeTokenRecord, RefreshTokenRecord, RotateOutcome,
};
