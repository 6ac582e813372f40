//! Request-scoped tenant sessions.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::backend::DataBackend;
use super::interceptor::{BypassInterceptor, QueryInterceptor, TenantInterceptor};
use super::query::{Delete, Filter, Include, Insert, Query, Record, Update};
use super::schema::{AssociationKind, Schema};
use super::{ID_COLUMN, IsolationMode, TenancyError};
use crate::models::TenantId;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Entry point for tenant data access: a backend, its schema and the
/// configured isolation mode.
#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn DataBackend>,
    schema: Arc<Schema>,
    mode: IsolationMode,
}

impl Database {
    pub fn new(backend: Arc<dyn DataBackend>, schema: Schema, mode: IsolationMode) -> Self {
        Self {
            backend,
            schema: Arc::new(schema),
            mode,
        }
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Bind a session to `tenant_id` with an explicit mode.
    pub fn open_tenant_session(&self, tenant_id: TenantId, mode: IsolationMode) -> TenantSession {
        self.session(Some(tenant_id), mode)
    }

    /// Bind a session to `tenant_id` with the configured mode.
    pub fn open_session(&self, tenant_id: TenantId) -> TenantSession {
        self.session(Some(tenant_id), self.mode)
    }

    /// A session with no tenant bound. Global tables work; tenant-scoped ones
    /// fail in strict mode and run unfiltered (with a warning) in permissive mode.
    pub fn unscoped(&self) -> TenantSession {
        self.session(None, self.mode)
    }

    fn session(&self, scope: Option<TenantId>, mode: IsolationMode) -> TenantSession {
        TenantSession {
            backend: self.backend.clone(),
            schema: self.schema.clone(),
            interceptor: TenantInterceptor::new(scope, mode, self.schema.clone()),
        }
    }
}

/// Data-access handle bound to at most one tenant.
///
/// The binding is fixed at construction; there is no way to rebind a session.
#[derive(Clone)]
pub struct TenantSession {
    backend: Arc<dyn DataBackend>,
    schema: Arc<Schema>,
    interceptor: TenantInterceptor,
}

impl TenantSession {
    pub fn tenant_id(&self) -> Option<TenantId> {
        self.interceptor.scope()
    }

    pub fn mode(&self) -> IsolationMode {
        self.interceptor.mode()
    }

    pub async fn find(&self, query: Query) -> Result<Vec<Record>, TenancyError> {
        self.run_find(&self.interceptor, query).await
    }

    pub async fn find_one(&self, query: Query) -> Result<Option<Record>, TenancyError> {
        Ok(self.find(query.limit(1)).await?.into_iter().next())
    }

    pub async fn create(
        &self,
        table: impl Into<String>,
        record: Record,
    ) -> Result<Record, TenancyError> {
        self.run_create(
            &self.interceptor,
            Insert {
                table: table.into(),
                record,
            },
        )
        .await
    }

    pub async fn update(
        &self,
        table: impl Into<String>,
        filters: Vec<Filter>,
        changes: Record,
    ) -> Result<Vec<Record>, TenancyError> {
        self.run_update(
            &self.interceptor,
            Update {
                table: table.into(),
                filters,
                changes,
            },
        )
        .await
    }

    pub async fn delete(
        &self,
        table: impl Into<String>,
        filters: Vec<Filter>,
    ) -> Result<u64, TenancyError> {
        self.run_delete(
            &self.interceptor,
            Delete {
                table: table.into(),
                filters,
            },
        )
        .await
    }

    /// Run the next operation without the tenant predicate.
    pub fn bypass(&self, grant: BypassGrant) -> Bypassed<'_> {
        Bypassed {
            session: self,
            grant,
        }
    }

    async fn run_find(
        &self,
        interceptor: &dyn QueryInterceptor,
        mut query: Query,
    ) -> Result<Vec<Record>, TenancyError> {
        interceptor.on_read(&mut query)?;
        let mut rows = self.backend.select(&query).await?;
        self.load_includes(&query.table, &mut rows, &query.includes)
            .await?;
        Ok(rows)
    }

    async fn run_create(
        &self,
        interceptor: &dyn QueryInterceptor,
        mut insert: Insert,
    ) -> Result<Record, TenancyError> {
        interceptor.on_create(&mut insert)?;
        self.backend.insert(&insert).await
    }

    async fn run_update(
        &self,
        interceptor: &dyn QueryInterceptor,
        mut update: Update,
    ) -> Result<Vec<Record>, TenancyError> {
        if update.changes.is_empty() {
            return Err(TenancyError::InvalidRecord("no changes given".into()));
        }
        interceptor.on_update(&mut update)?;
        self.backend.update(&update).await
    }

    async fn run_delete(
        &self,
        interceptor: &dyn QueryInterceptor,
        mut delete: Delete,
    ) -> Result<u64, TenancyError> {
        interceptor.on_delete(&mut delete)?;
        self.backend.delete(&delete).await
    }

    /// Attach each include to its parent rows under the association name.
    /// The include filters already carry the tenant predicate.
    fn load_includes<'a>(
        &'a self,
        table: &'a str,
        rows: &'a mut [Record],
        includes: &'a [Include],
    ) -> BoxFuture<'a, Result<(), TenancyError>> {
        Box::pin(async move {
            for include in includes {
                let assoc = self.schema.association(table, &include.association)?;
                let (local_key, remote_key) = match assoc.kind {
                    AssociationKind::HasMany => (ID_COLUMN, assoc.foreign_key.as_str()),
                    AssociationKind::BelongsTo => (assoc.foreign_key.as_str(), ID_COLUMN),
                };

                let mut seen = HashSet::new();
                let keys: Vec<Value> = rows
                    .iter()
                    .filter_map(|r| r.get(local_key))
                    .filter(|v| !v.is_null() && seen.insert(v.to_string()))
                    .cloned()
                    .collect();

                let mut children = Vec::new();
                if !keys.is_empty() {
                    let mut filters = include.filters.clone();
                    filters.push(Filter::is_in(remote_key, keys));
                    children = self
                        .backend
                        .select(&Query {
                            table: assoc.target.clone(),
                            filters,
                            ..Query::default()
                        })
                        .await?;
                    self.load_includes(&assoc.target, &mut children, &include.includes)
                        .await?;
                }

                for row in rows.iter_mut() {
                    let key = row.get(local_key).filter(|v| !v.is_null()).cloned();
                    let linked = children
                        .iter()
                        .filter(|c| key.is_some() && c.get(remote_key) == key.as_ref());
                    let value = match assoc.kind {
                        AssociationKind::HasMany => {
                            Value::Array(linked.cloned().map(Value::Object).collect())
                        }
                        AssociationKind::BelongsTo => linked
                            .take(1)
                            .cloned()
                            .map(Value::Object)
                            .next()
                            .unwrap_or(Value::Null),
                    };
                    row.insert(assoc.name.clone(), value);
                }
            }
            Ok(())
        })
    }
}

/// Permission to run one operation outside tenant isolation.
///
/// Built from a `&'static str` reason, so it can only come from a literal in
/// trusted code, never from request data. Not `Clone`: one grant, one call.
#[derive(Debug)]
pub struct BypassGrant {
    reason: &'static str,
}

impl BypassGrant {
    pub const fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// A session for exactly one unfiltered, audited operation.
pub struct Bypassed<'s> {
    session: &'s TenantSession,
    grant: BypassGrant,
}

impl Bypassed<'_> {
    fn interceptor(&self) -> BypassInterceptor<'_> {
        BypassInterceptor {
            schema: &self.session.schema,
            reason: self.grant.reason,
            session_tenant: self.session.tenant_id(),
        }
    }

    pub async fn find(self, query: Query) -> Result<Vec<Record>, TenancyError> {
        self.session.run_find(&self.interceptor(), query).await
    }

    pub async fn create(
        self,
        table: impl Into<String>,
        record: Record,
    ) -> Result<Record, TenancyError> {
        let insert = Insert {
            table: table.into(),
            record,
        };
        self.session.run_create(&self.interceptor(), insert).await
    }

    pub async fn update(
        self,
        table: impl Into<String>,
        filters: Vec<Filter>,
        changes: Record,
    ) -> Result<Vec<Record>, TenancyError> {
        let update = Update {
            table: table.into(),
            filters,
            changes,
        };
        self.session.run_update(&self.interceptor(), update).await
    }

    pub async fn delete(
        self,
        table: impl Into<String>,
        filters: Vec<Filter>,
    ) -> Result<u64, TenancyError> {
        let delete = Delete {
            table: table.into(),
            filters,
        };
        self.session.run_delete(&self.interceptor(), delete).await
    }
}
