//! Tenant-scoped record handlers.
//!
//! A thin generic surface over the registered business tables. Every call
//! goes through the request's `TenantSession`; handlers only translate HTTP
//! into structured queries and check the caller's role.

use std::collections::HashMap;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, Query as QueryParams};
use axum::http::StatusCode;
use serde_json::Value;
use tally_core::auth::jwt::AccessClaims;
use tally_core::models::Capability;
use tally_core::tenancy::{Filter, ID_COLUMN, Include, Query, Record, TenantSession};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::DeletedResponse;

fn require(claims: &AccessClaims, capability: Capability) -> AppResult<()> {
    if claims.role.can(capability) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "role '{}' may not {capability:?} records",
            claims.role
        )))
    }
}

/// Parse `include=orders.lines,customer` into a tree of includes.
pub fn parse_includes(spec: &str) -> Vec<Include> {
    let mut roots: Vec<Include> = Vec::new();
    for path in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut level = &mut roots;
        for name in path.split('.').filter(|n| !n.is_empty()) {
            let idx = match level.iter().position(|i| i.association == name) {
                Some(idx) => idx,
                None => {
                    level.push(Include::new(name));
                    level.len() - 1
                }
            };
            level = &mut level[idx].includes;
        }
    }
    roots
}

/// Apply `include`, `limit`, `orderBy` and equality filters from the query string.
fn build_query(table: String, params: HashMap<String, String>) -> AppResult<Query> {
    let mut query = Query::from(table);
    for (key, value) in params {
        query = match key.as_str() {
            "include" => parse_includes(&value)
                .into_iter()
                .fold(query, Query::include),
            "limit" => query.limit(
                value
                    .parse()
                    .map_err(|_| AppError::Validation(format!("invalid limit '{value}'")))?,
            ),
            "orderBy" => match value.strip_prefix('-') {
                Some(column) => query.order_by(column, true),
                None => query.order_by(value, false),
            },
            _ => query.eq(key, Value::String(value)),
        };
    }
    Ok(query)
}

fn id_filter(id: String) -> Vec<Filter> {
    vec![Filter::eq(ID_COLUMN, Value::String(id))]
}

/// `GET /api/records/{table}`
pub async fn list_records_handler(
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    Extension(session): Extension<TenantSession>,
    Path(table): Path<String>,
    QueryParams(params): QueryParams<HashMap<String, String>>,
) -> AppResult<Json<Vec<Record>>> {
    require(&claims, Capability::View)?;
    let rows = session.find(build_query(table, params)?).await?;
    Ok(Json(rows))
}

/// `GET /api/records/{table}/{id}`
pub async fn get_record_handler(
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    Extension(session): Extension<TenantSession>,
    Path((table, id)): Path<(String, String)>,
    QueryParams(mut params): QueryParams<HashMap<String, String>>,
) -> AppResult<Json<Record>> {
    require(&claims, Capability::View)?;
    params.retain(|k, _| k == "include");
    let query = build_query(table.clone(), params)?.eq(ID_COLUMN, Value::String(id.clone()));
    session
        .find_one(query)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{table}/{id}")))
}

/// `POST /api/records/{table}`
pub async fn create_record_handler(
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    Extension(session): Extension<TenantSession>,
    Path(table): Path<String>,
    payload: Result<Json<Record>, JsonRejection>,
) -> AppResult<(StatusCode, Json<Record>)> {
    require(&claims, Capability::Create)?;
    let Json(record) = payload?;
    let created = session.create(table.as_str(), record).await?;
    debug!(%table, user_id = %claims.sub, "record created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// `PATCH /api/records/{table}/{id}`
pub async fn update_record_handler(
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    Extension(session): Extension<TenantSession>,
    Path((table, id)): Path<(String, String)>,
    payload: Result<Json<Record>, JsonRejection>,
) -> AppResult<Json<Record>> {
    require(&claims, Capability::Edit)?;
    let Json(changes) = payload?;
    session
        .update(table.as_str(), id_filter(id.clone()), changes)
        .await?
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{table}/{id}")))
}

/// `DELETE /api/records/{table}/{id}`
pub async fn delete_record_handler(
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    Extension(session): Extension<TenantSession>,
    Path((table, id)): Path<(String, String)>,
) -> AppResult<Json<DeletedResponse>> {
    require(&claims, Capability::Delete)?;
    match session.delete(table.as_str(), id_filter(id.clone())).await? {
        0 => Err(AppError::NotFound(format!("{table}/{id}"))),
        deleted => Ok(Json(DeletedResponse { deleted })),
    }
}
