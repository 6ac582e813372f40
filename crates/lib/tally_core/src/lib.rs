//! # tally_core
//!
//! Tenant isolation and credential security for Tally.
//!
//! Every business module reaches tenant data through a [`tenancy::TenantSession`]
//! and every identity decision goes through the primitives in [`auth`].

pub mod auth;
pub mod error;
pub mod models;
pub mod store;
pub mod tenancy;

pub use error::ErrorKind;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
