//! Data backends for tenant-scoped tables.
//!
//! A backend executes exactly the clauses it is handed. It knows nothing about
//! sessions or tenants beyond evaluating `Filter::Tenant` like any other
//! clause; associations are loaded by the session, not here.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::query::{Delete, Insert, Query, Record, Update, compare_values};
use super::{ID_COLUMN, TENANT_COLUMN, TenancyError};

#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Rows of `query.table` matching every filter. `includes` are ignored.
    async fn select(&self, query: &Query) -> Result<Vec<Record>, TenancyError>;

    /// Insert one row and return it as stored.
    async fn insert(&self, insert: &Insert) -> Result<Record, TenancyError>;

    /// Apply `changes` to every matching row and return the updated rows.
    async fn update(&self, update: &Update) -> Result<Vec<Record>, TenancyError>;

    /// Delete every matching row and return how many went.
    async fn delete(&self, delete: &Delete) -> Result<u64, TenancyError>;
}

/// In-process backend holding rows per table.
///
/// Mirrors the database guards: rows get an id when none is given, and an
/// update can never move a row to another tenant.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Vec<Record>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataBackend for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Record>, TenancyError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Record> = tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = &query.order_by {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.descending { ord.reverse() } else { ord }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(rows)
    }

    async fn insert(&self, insert: &Insert) -> Result<Record, TenancyError> {
        let mut record = insert.record.clone();
        match record.get(ID_COLUMN) {
            None | Some(Value::Null) => {
                record.insert(ID_COLUMN.into(), Value::String(Uuid::now_v7().to_string()));
            }
            Some(_) => {}
        }

        let mut tables = self.tables.write().await;
        let rows = tables.entry(insert.table.clone()).or_default();
        if rows.iter().any(|r| r.get(ID_COLUMN) == record.get(ID_COLUMN)) {
            return Err(TenancyError::InvalidRecord(format!(
                "duplicate id in '{}'",
                insert.table
            )));
        }
        rows.push(record.clone());
        Ok(record)
    }

    async fn update(&self, update: &Update) -> Result<Vec<Record>, TenancyError> {
        if update.changes.contains_key(ID_COLUMN) {
            return Err(TenancyError::InvalidRecord("id cannot be changed".into()));
        }
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(&update.table) else {
            return Ok(Vec::new());
        };

        let matching: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| update.filters.iter().all(|f| f.matches(r)))
            .map(|(i, _)| i)
            .collect();

        if let Some(new_tenant) = update.changes.get(TENANT_COLUMN)
            && matching
                .iter()
                .any(|&i| rows[i].get(TENANT_COLUMN) != Some(new_tenant))
        {
            return Err(TenancyError::TenantIdImmutable {
                table: update.table.clone(),
            });
        }

        let mut updated = Vec::with_capacity(matching.len());
        for i in matching {
            for (column, value) in &update.changes {
                rows[i].insert(column.clone(), value.clone());
            }
            updated.push(rows[i].clone());
        }
        Ok(updated)
    }

    async fn delete(&self, delete: &Delete) -> Result<u64, TenancyError> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(&delete.table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !delete.filters.iter().all(|f| f.matches(r)));
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenancy::Filter;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_id_and_select_orders() {
        let backend = MemoryBackend::new();
        for name in ["b", "a", "c"] {
            let row = backend
                .insert(&Insert {
                    table: "currencies".into(),
                    record: record(json!({"code": name})),
                })
                .await
                .unwrap();
            assert!(row.get("id").and_then(Value::as_str).is_some());
        }
        let rows = backend
            .select(&Query::from("currencies").order_by("code", false).limit(2))
            .await
            .unwrap();
        let codes: Vec<_> = rows.iter().map(|r| r["code"].clone()).collect();
        assert_eq!(codes, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn backend_refuses_to_move_rows_between_tenants() {
        let backend = MemoryBackend::new();
        backend
            .insert(&Insert {
                table: "customers".into(),
                record: record(json!({"id": "c1", "tenant_id": "t1"})),
            })
            .await
            .unwrap();
        let err = backend
            .update(&Update {
                table: "customers".into(),
                filters: vec![Filter::eq("id", "c1")],
                changes: record(json!({"tenant_id": "t2"})),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::TenantIdImmutable { .. }));
    }

    #[tokio::test]
    async fn delete_removes_only_matching_rows() {
        let backend = MemoryBackend::new();
        for id in ["1", "2"] {
            backend
                .insert(&Insert {
                    table: "currencies".into(),
                    record: record(json!({"id": id})),
                })
                .await
                .unwrap();
        }
        let removed = backend
            .delete(&Delete {
                table: "currencies".into(),
                filters: vec![Filter::eq("id", "1")],
            })
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            backend.select(&Query::from("currencies")).await.unwrap().len(),
            1
        );
    }
}
