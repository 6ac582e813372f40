//! PostgreSQL data backend.
//!
//! Structured operations are compiled with `sqlx::QueryBuilder`. Identifiers
//! are validated and quoted; every value travels as a bind parameter. Rows
//! come back as `to_jsonb(t)` and go in through `jsonb_populate_record`, so the
//! backend needs no per-table Rust types.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::backend::DataBackend;
use super::query::{Delete, Filter, Insert, Query, Record, Update};
use super::{ID_COLUMN, TENANT_COLUMN, TenancyError};

/// SQLSTATE `undefined_column`.
const UNDEFINED_COLUMN: &str = "42703";

#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Quote an identifier after checking it is a plain lowercase SQL name.
fn ident(name: &str) -> Result<String, TenancyError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63;
    if valid {
        Ok(format!("\"{name}\""))
    } else {
        Err(TenancyError::InvalidRecord(format!(
            "'{name}' is not a valid identifier"
        )))
    }
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) -> Result<(), TenancyError> {
    for (i, filter) in filters.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        match filter {
            Filter::Eq { column, value } => {
                qb.push(format!("to_jsonb(t.{}) = ", ident(column)?));
                qb.push_bind(value.clone());
            }
            Filter::In { column, values } if values.is_empty() => {
                // Keep the column check so an unknown column still errors.
                qb.push(format!("(t.{} IS NULL AND FALSE)", ident(column)?));
            }
            Filter::In { column, values } => {
                qb.push(format!("to_jsonb(t.{}) = ANY(", ident(column)?));
                qb.push_bind(values.clone());
                qb.push(")");
            }
            Filter::Tenant(predicate) => {
                qb.push(format!("t.{} = ", ident(TENANT_COLUMN)?));
                qb.push_bind(predicate.tenant_id().as_uuid());
            }
        }
    }
    Ok(())
}

fn map_db_error(e: sqlx::Error) -> TenancyError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_COLUMN) => {
            TenancyError::InvalidRecord(db.message().to_string())
        }
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
            TenancyError::InvalidRecord(db.message().to_string())
        }
        _ => TenancyError::Backend(e),
    }
}

fn into_record(value: Value) -> Result<Record, TenancyError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(TenancyError::InvalidRecord(format!(
            "expected a row object, got {other}"
        ))),
    }
}

#[async_trait]
impl DataBackend for PgBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Record>, TenancyError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT to_jsonb(t) FROM {} AS t",
            ident(&query.table)?
        ));
        push_where(&mut qb, &query.filters)?;
        if let Some(order) = &query.order_by {
            qb.push(format!(
                " ORDER BY t.{} {}",
                ident(&order.column)?,
                if order.descending { "DESC" } else { "ASC" }
            ));
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<Value> = qb
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        rows.into_iter().map(into_record).collect()
    }

    async fn insert(&self, insert: &Insert) -> Result<Record, TenancyError> {
        let mut record = insert.record.clone();
        if record.get(ID_COLUMN).is_none_or(Value::is_null) {
            record.insert(ID_COLUMN.into(), Value::String(Uuid::now_v7().to_string()));
        }
        let table = ident(&insert.table)?;
        let columns = record
            .keys()
            .map(|k| ident(k))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {table} AS t ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, "
        ));
        qb.push_bind(Value::Object(record));
        qb.push(") RETURNING to_jsonb(t)");

        let row: Value = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;
        into_record(row)
    }

    async fn update(&self, update: &Update) -> Result<Vec<Record>, TenancyError> {
        if update.changes.contains_key(ID_COLUMN) {
            return Err(TenancyError::InvalidRecord("id cannot be changed".into()));
        }
        let table = ident(&update.table)?;
        let assignments = update
            .changes
            .keys()
            .map(|k| ident(k).map(|c| format!("{c} = r.{c}")))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "UPDATE {table} AS t SET {assignments} FROM jsonb_populate_record(NULL::{table}, "
        ));
        qb.push_bind(Value::Object(update.changes.clone()));
        qb.push(") AS r");
        push_where(&mut qb, &update.filters)?;
        qb.push(" RETURNING to_jsonb(t)");

        let rows: Vec<Value> = qb
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        rows.into_iter().map(into_record).collect()
    }

    async fn delete(&self, delete: &Delete) -> Result<u64, TenancyError> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("DELETE FROM {} AS t", ident(&delete.table)?));
        push_where(&mut qb, &delete.filters)?;
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantId;
    use crate::tenancy::query::TenantPredicate;
    use serde_json::json;

    #[test]
    fn identifiers_are_validated_and_quoted() {
        assert_eq!(ident("sales_orders").unwrap(), "\"sales_orders\"");
        assert!(ident("Robert'); DROP TABLE x;--").is_err());
        assert!(ident("1abc").is_err());
        assert!(ident("").is_err());
        assert!(ident("has space").is_err());
    }

    #[test]
    fn select_compiles_structured_filters_to_binds() {
        let tenant = TenantId::generate();
        let mut qb = QueryBuilder::<Postgres>::new("SELECT to_jsonb(t) FROM \"customers\" AS t");
        push_where(
            &mut qb,
            &[
                Filter::eq("name", json!("Acme")),
                Filter::is_in("id", vec![json!("a"), json!("b")]),
                Filter::Tenant(TenantPredicate::new(tenant)),
            ],
        )
        .unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT to_jsonb(t) FROM \"customers\" AS t WHERE to_jsonb(t.\"name\") = $1 \
             AND to_jsonb(t.\"id\") = ANY($2) AND t.\"tenant_id\" = $3"
        );
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM \"customers\" AS t");
        push_where(&mut qb, &[Filter::is_in("id", vec![])]).unwrap();
        assert!(qb.sql().ends_with("WHERE (t.\"id\" IS NULL AND FALSE)"));
    }

    #[test]
    fn malicious_column_names_never_reach_sql() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM \"customers\" AS t");
        let err = push_where(&mut qb, &[Filter::eq("x\" OR 1=1 --", json!(1))]).unwrap_err();
        assert!(matches!(err, TenancyError::InvalidRecord(_)));
    }
}
