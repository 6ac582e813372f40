//! Query isolation interceptor.
//!
//! Every operation issued through a session passes exactly one interceptor
//! before it reaches the backend. `TenantInterceptor` is the normal path;
//! `BypassInterceptor` is only reachable through a `BypassGrant`.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::query::{Delete, Filter, Include, Insert, Query, TenantPredicate, Update};
use super::schema::Schema;
use super::{IsolationMode, TENANT_COLUMN, TenancyError};
use crate::models::TenantId;

/// Rewrites or rejects operations before they reach a backend.
pub trait QueryInterceptor: Send + Sync {
    fn on_create(&self, insert: &mut Insert) -> Result<(), TenancyError>;

    fn on_read(&self, query: &mut Query) -> Result<(), TenancyError>;

    fn on_update(&self, update: &mut Update) -> Result<(), TenancyError>;

    fn on_delete(&self, delete: &mut Delete) -> Result<(), TenancyError>;
}

/// Confines operations to one tenant.
#[derive(Debug, Clone)]
pub struct TenantInterceptor {
    scope: Option<TenantId>,
    mode: IsolationMode,
    schema: Arc<Schema>,
}

impl TenantInterceptor {
    pub fn new(scope: Option<TenantId>, mode: IsolationMode, schema: Arc<Schema>) -> Self {
        Self {
            scope,
            mode,
            schema,
        }
    }

    pub fn scope(&self) -> Option<TenantId> {
        self.scope
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    /// Predicate for a tenant-scoped table, or the missing-context outcome.
    fn predicate(&self, table: &str, op: &str) -> Result<Option<TenantPredicate>, TenancyError> {
        match (self.scope, self.mode) {
            (Some(tenant), _) => Ok(Some(TenantPredicate::new(tenant))),
            (None, IsolationMode::Strict) => Err(TenancyError::ContextRequired {
                table: table.to_string(),
            }),
            (None, IsolationMode::Permissive) => {
                warn!(
                    table,
                    op, "tenant-scoped operation without tenant context; running unfiltered"
                );
                Ok(None)
            }
        }
    }

    fn scope_filters(
        &self,
        table: &str,
        op: &str,
        filters: &mut Vec<Filter>,
    ) -> Result<(), TenancyError> {
        if self.schema.table(table)?.tenant_scoped
            && let Some(predicate) = self.predicate(table, op)?
        {
            filters.push(Filter::Tenant(predicate));
        }
        Ok(())
    }

    fn scope_includes(&self, parent: &str, includes: &mut [Include]) -> Result<(), TenancyError> {
        for include in includes {
            let target = self
                .schema
                .association(parent, &include.association)?
                .target
                .clone();
            self.scope_filters(&target, "read", &mut include.filters)?;
            self.scope_includes(&target, &mut include.includes)?;
        }
        Ok(())
    }
}

impl QueryInterceptor for TenantInterceptor {
    fn on_create(&self, insert: &mut Insert) -> Result<(), TenancyError> {
        if !self.schema.table(&insert.table)?.tenant_scoped {
            return Ok(());
        }
        let Some(predicate) = self.predicate(&insert.table, "create")? else {
            return Ok(());
        };
        let session = predicate.tenant_id();
        match insert.record.get(TENANT_COLUMN) {
            None | Some(Value::Null) => {
                insert
                    .record
                    .insert(TENANT_COLUMN.into(), Value::String(session.to_string()));
                Ok(())
            }
            Some(given) => {
                let same = given
                    .as_str()
                    .and_then(|s| s.parse::<TenantId>().ok())
                    .is_some_and(|t| t == session);
                if same {
                    // Stored form must match what the read filter compares against.
                    insert
                        .record
                        .insert(TENANT_COLUMN.into(), Value::String(session.to_string()));
                    Ok(())
                } else {
                    Err(TenancyError::TenantMismatch {
                        table: insert.table.clone(),
                        session,
                        payload: given.to_string(),
                    })
                }
            }
        }
    }

    fn on_read(&self, query: &mut Query) -> Result<(), TenancyError> {
        self.scope_filters(&query.table, "read", &mut query.filters)?;
        let table = query.table.clone();
        self.scope_includes(&table, &mut query.includes)
    }

    fn on_update(&self, update: &mut Update) -> Result<(), TenancyError> {
        reject_tenant_change(update)?;
        self.scope_filters(&update.table, "update", &mut update.filters)
    }

    fn on_delete(&self, delete: &mut Delete) -> Result<(), TenancyError> {
        self.scope_filters(&delete.table, "delete", &mut delete.filters)
    }
}

/// Runs one operation unfiltered and writes an audit record for it.
///
/// Tables and associations are still validated, and `tenant_id` stays
/// immutable.
pub(crate) struct BypassInterceptor<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) reason: &'static str,
    pub(crate) session_tenant: Option<TenantId>,
}

impl BypassInterceptor<'_> {
    fn audit(&self, op: &str, table: &str) {
        warn!(
            target: "tally::audit",
            reason = self.reason,
            op,
            table,
            session_tenant = ?self.session_tenant,
            "tenant isolation bypassed"
        );
    }

    fn check_includes(&self, parent: &str, includes: &[Include]) -> Result<(), TenancyError> {
        for include in includes {
            let target = &self.schema.association(parent, &include.association)?.target;
            self.check_includes(target, &include.includes)?;
        }
        Ok(())
    }
}

impl QueryInterceptor for BypassInterceptor<'_> {
    fn on_create(&self, insert: &mut Insert) -> Result<(), TenancyError> {
        self.schema.table(&insert.table)?;
        self.audit("create", &insert.table);
        Ok(())
    }

    fn on_read(&self, query: &mut Query) -> Result<(), TenancyError> {
        self.schema.table(&query.table)?;
        self.check_includes(&query.table, &query.includes)?;
        self.audit("read", &query.table);
        Ok(())
    }

    fn on_update(&self, update: &mut Update) -> Result<(), TenancyError> {
        self.schema.table(&update.table)?;
        reject_tenant_change(update)?;
        self.audit("update", &update.table);
        Ok(())
    }

    fn on_delete(&self, delete: &mut Delete) -> Result<(), TenancyError> {
        self.schema.table(&delete.table)?;
        self.audit("delete", &delete.table);
        Ok(())
    }
}

/// An update payload may never mention `tenant_id`, whatever its value.
fn reject_tenant_change(update: &Update) -> Result<(), TenancyError> {
    if update.changes.contains_key(TENANT_COLUMN) {
        return Err(TenancyError::TenantIdImmutable {
            table: update.table.clone(),
        });
    }
    Ok(())
}
