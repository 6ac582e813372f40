//! Structured query model.
//!
//! Queries, inserts, updates and deletes are plain data. Backends compile
//! them; the interceptor rewrites them before they get there.

use std::cmp::Ordering;

use serde_json::Value;

use super::TENANT_COLUMN;
use crate::models::TenantId;

/// A row exchanged with a backend: column name to JSON value.
pub type Record = serde_json::Map<String, Value>;

/// `tenant_id = <tenant>` clause.
///
/// Only this crate can build one, so a caller cannot forge or pre-empt the
/// predicate the interceptor attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantPredicate(TenantId);

impl TenantPredicate {
    pub(crate) fn new(tenant_id: TenantId) -> Self {
        Self(tenant_id)
    }

    pub fn tenant_id(&self) -> TenantId {
        self.0
    }
}

/// A single conjunctive clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
    Tenant(TenantPredicate),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In {
            column: column.into(),
            values,
        }
    }

    pub fn is_tenant(&self) -> bool {
        matches!(self, Filter::Tenant(_))
    }

    /// In-process evaluation against one record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Eq { column, value } => record.get(column) == Some(value),
            Filter::In { column, values } => record
                .get(column)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Filter::Tenant(predicate) => record
                .get(TENANT_COLUMN)
                .and_then(Value::as_str)
                .is_some_and(|v| v == predicate.tenant_id().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// Eager-load an association of the parent rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub association: String,
    pub filters: Vec<Filter>,
    pub includes: Vec<Include>,
}

impl Include {
    pub fn new(association: impl Into<String>) -> Self {
        Self {
            association: association.into(),
            filters: Vec::new(),
            includes: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn include(mut self, include: Include) -> Self {
        self.includes.push(include);
        self
    }

    pub fn has_tenant_filter(&self) -> bool {
        self.filters.iter().any(Filter::is_tenant)
    }
}

/// Read of one table, optionally with eager-loaded associations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub includes: Vec<Include>,
    pub order_by: Option<Order>,
    pub limit: Option<u64>,
}

impl Query {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    pub fn include(mut self, include: Include) -> Self {
        self.includes.push(include);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(Order {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn has_tenant_filter(&self) -> bool {
        self.filters.iter().any(Filter::is_tenant)
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub record: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub filters: Vec<Filter>,
    pub changes: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub filters: Vec<Filter>,
}

/// Total order over JSON scalars for in-process sorting: null < bool <
/// number < string, anything else compares equal.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn filters_match_records() {
        let row = record(json!({"id": "1", "status": "draft", "qty": 3}));
        assert!(Filter::eq("status", "draft").matches(&row));
        assert!(!Filter::eq("status", "sent").matches(&row));
        assert!(Filter::is_in("qty", vec![json!(1), json!(3)]).matches(&row));
        assert!(!Filter::is_in("missing", vec![json!(3)]).matches(&row));
    }

    #[test]
    fn tenant_predicate_compares_tenant_column() {
        let tenant = TenantId::generate();
        let row = record(json!({"tenant_id": tenant.to_string()}));
        let other = record(json!({"tenant_id": TenantId::generate().to_string()}));
        let filter = Filter::Tenant(TenantPredicate::new(tenant));
        assert!(filter.matches(&row));
        assert!(!filter.matches(&other));
        assert!(!filter.matches(&Record::new()));
    }

    #[test]
    fn builder_collects_clauses() {
        let q = Query::from("customers")
            .eq("name", "Acme")
            .include(Include::new("orders"))
            .order_by("name", true)
            .limit(5);
        assert_eq!(q.table, "customers");
        assert_eq!(q.filters.len(), 1);
        assert_eq!(q.includes[0].association, "orders");
        assert_eq!(q.limit, Some(5));
        assert!(!q.has_tenant_filter());
    }

    #[test]
    fn values_sort_by_type_then_value() {
        assert_eq!(
            compare_values(Some(&json!(2)), Some(&json!(10))),
            Ordering::Less
        );
        assert_eq!(
            compare_values(Some(&json!("b")), Some(&json!("a"))),
            Ordering::Greater
        );
        assert_eq!(compare_values(None, Some(&json!("a"))), Ordering::Less);
    }
}
