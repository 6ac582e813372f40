#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use crate::models::TenantId;
    use crate::tenancy::{
        BypassGrant, Database, Filter, Include, IsolationMode, MemoryBackend, Query,
        QueryInterceptor, Record, TenancyError, TenantInterceptor, business_schema,
    };

    fn db(mode: IsolationMode) -> Database {
        Database::new(Arc::new(MemoryBackend::new()), business_schema(), mode)
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn tenant_of(row: &Record) -> Option<&str> {
        row.get("tenant_id").and_then(Value::as_str)
    }

    #[tokio::test]
    async fn create_fills_tenant_from_session() {
        let db = db(IsolationMode::Strict);
        let t1 = TenantId::generate();
        let row = db
            .open_session(t1)
            .create("customers", record(json!({"name": "Acme"})))
            .await
            .unwrap();
        assert_eq!(tenant_of(&row), Some(t1.to_string().as_str()));
    }

    #[tokio::test]
    async fn create_with_foreign_tenant_is_rejected() {
        let db = db(IsolationMode::Strict);
        let session = db.open_session(TenantId::generate());
        let other = TenantId::generate();
        let err = session
            .create(
                "customers",
                record(json!({"name": "Acme", "tenant_id": other.to_string()})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::TenantMismatch { .. }));
        assert!(session.find(Query::from("customers")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_with_own_tenant_is_accepted() {
        let db = db(IsolationMode::Strict);
        let t1 = TenantId::generate();
        let row = db
            .open_session(t1)
            .create(
                "customers",
                record(json!({"name": "Acme", "tenant_id": t1.to_string()})),
            )
            .await
            .unwrap();
        assert_eq!(tenant_of(&row), Some(t1.to_string().as_str()));
    }

    #[tokio::test]
    async fn create_with_own_tenant_in_other_spelling_is_stored_canonically() {
        let db = db(IsolationMode::Strict);
        let t1 = TenantId::generate();
        let session = db.open_session(t1);
        for spelling in [t1.to_string().to_uppercase(), format!("{{{t1}}}")] {
            let row = session
                .create(
                    "customers",
                    record(json!({"name": "Acme", "tenant_id": spelling})),
                )
                .await
                .unwrap();
            assert_eq!(tenant_of(&row), Some(t1.to_string().as_str()));
        }
        assert_eq!(session.find(Query::from("customers")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn read_by_id_from_other_tenant_returns_nothing() {
        let db = db(IsolationMode::Strict);
        let t1 = db.open_session(TenantId::generate());
        let t2 = db.open_session(TenantId::generate());

        let row = t1
            .create("customers", record(json!({"name": "Acme"})))
            .await
            .unwrap();
        let id = row["id"].clone();

        let seen_by_t2 = t2
            .find(Query::from("customers").eq("id", id.clone()))
            .await
            .unwrap();
        assert!(seen_by_t2.is_empty());

        let seen_by_t1 = t1.find(Query::from("customers").eq("id", id)).await.unwrap();
        assert_eq!(seen_by_t1.len(), 1);
    }

    #[tokio::test]
    async fn nested_includes_never_leak_foreign_rows() {
        let db = db(IsolationMode::Strict);
        let t1 = TenantId::generate();
        let t2 = TenantId::generate();
        let s1 = db.open_session(t1);
        let s2 = db.open_session(t2);

        let foreign_customer = s1
            .create("customers", record(json!({"name": "T1 customer"})))
            .await
            .unwrap();
        let own_customer = s2
            .create("customers", record(json!({"name": "T2 customer"})))
            .await
            .unwrap();

        // A T2 order pointing at T1's customer, and a T1 order pointing at T2's.
        let order = s2
            .create(
                "sales_orders",
                record(json!({"customer_id": foreign_customer["id"].clone()})),
            )
            .await
            .unwrap();
        s1.create(
            "sales_orders",
            record(json!({"customer_id": own_customer["id"].clone()})),
        )
        .await
        .unwrap();
        s1.create(
            "sales_order_lines",
            record(json!({"order_id": order["id"].clone(), "quantity": 1})),
        )
        .await
        .unwrap();

        let orders = s2
            .find(
                Query::from("sales_orders")
                    .include(Include::new("customer"))
                    .include(Include::new("lines")),
            )
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0]["customer"], Value::Null);
        assert_eq!(orders[0]["lines"], json!([]));

        let customers = s2
            .find(
                Query::from("customers")
                    .include(Include::new("orders").include(Include::new("lines"))),
            )
            .await
            .unwrap();
        assert_eq!(customers.len(), 1);
        assert_eq!(customers[0]["orders"], json!([]));
    }

    #[tokio::test]
    async fn includes_load_same_tenant_rows() {
        let db = db(IsolationMode::Strict);
        let s = db.open_session(TenantId::generate());
        let customer = s
            .create("customers", record(json!({"name": "Acme"})))
            .await
            .unwrap();
        let order = s
            .create(
                "sales_orders",
                record(json!({"customer_id": customer["id"].clone()})),
            )
            .await
            .unwrap();
        for qty in [1, 2] {
            s.create(
                "sales_order_lines",
                record(json!({"order_id": order["id"].clone(), "quantity": qty})),
            )
            .await
            .unwrap();
        }

        let rows = s
            .find(
                Query::from("customers")
                    .include(Include::new("orders").include(Include::new("lines"))),
            )
            .await
            .unwrap();
        let orders = rows[0]["orders"].as_array().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0]["lines"].as_array().unwrap().len(), 2);

        let back = s
            .find(Query::from("sales_orders").include(Include::new("customer")))
            .await
            .unwrap();
        assert_eq!(back[0]["customer"]["name"], json!("Acme"));
    }

    #[test]
    fn interceptor_attaches_structured_tenant_clauses_to_every_level() {
        let tenant = TenantId::generate();
        let interceptor = TenantInterceptor::new(
            Some(tenant),
            IsolationMode::Strict,
            Arc::new(business_schema()),
        );
        let mut query = Query::from("customers")
            .include(Include::new("orders").include(Include::new("lines")));
        interceptor.on_read(&mut query).unwrap();

        assert!(query.has_tenant_filter());
        assert!(query.includes[0].has_tenant_filter());
        assert!(query.includes[0].includes[0].has_tenant_filter());
    }

    #[tokio::test]
    async fn update_and_delete_are_confined() {
        let db = db(IsolationMode::Strict);
        let s1 = db.open_session(TenantId::generate());
        let s2 = db.open_session(TenantId::generate());
        let row = s1
            .create("customers", record(json!({"name": "Acme"})))
            .await
            .unwrap();
        let by_id = || vec![Filter::eq("id", row["id"].clone())];

        let updated = s2
            .update("customers", by_id(), record(json!({"name": "Hijacked"})))
            .await
            .unwrap();
        assert!(updated.is_empty());
        assert_eq!(s2.delete("customers", by_id()).await.unwrap(), 0);

        let rows = s1.find(Query::from("customers")).await.unwrap();
        assert_eq!(rows[0]["name"], json!("Acme"));

        let updated = s1
            .update("customers", by_id(), record(json!({"name": "Acme Ltd"})))
            .await
            .unwrap();
        assert_eq!(updated[0]["name"], json!("Acme Ltd"));
        assert_eq!(s1.delete("customers", by_id()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tenant_id_in_update_payload_is_always_rejected() {
        let db = db(IsolationMode::Strict);
        let t1 = TenantId::generate();
        let s1 = db.open_session(t1);
        let row = s1
            .create("customers", record(json!({"name": "Acme"})))
            .await
            .unwrap();

        for target in [TenantId::generate(), t1] {
            let err = s1
                .update(
                    "customers",
                    vec![Filter::eq("id", row["id"].clone())],
                    record(json!({"tenant_id": target.to_string()})),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, TenancyError::TenantIdImmutable { .. }));
        }

        let err = s1
            .bypass(BypassGrant::new("test: immutability under bypass"))
            .update(
                "customers",
                vec![Filter::eq("id", row["id"].clone())],
                record(json!({"tenant_id": TenantId::generate().to_string()})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::TenantIdImmutable { .. }));
    }

    #[tokio::test]
    async fn strict_mode_requires_context_for_tenant_tables() {
        let db = db(IsolationMode::Strict);
        let unscoped = db.unscoped();

        let err = unscoped.find(Query::from("customers")).await.unwrap_err();
        assert!(matches!(err, TenancyError::ContextRequired { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::TenantContextRequired);

        let err = unscoped
            .create("customers", record(json!({"name": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::ContextRequired { .. }));

        // Global reference data needs no tenant.
        unscoped
            .create("currencies", record(json!({"code": "EUR", "name": "Euro"})))
            .await
            .unwrap();
        assert_eq!(
            unscoped.find(Query::from("currencies")).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn strict_mode_rejects_unscoped_tenant_include() {
        let db = db(IsolationMode::Strict);
        let s = db.open_tenant_session(TenantId::generate(), IsolationMode::Strict);
        s.create("customers", record(json!({"name": "Acme"})))
            .await
            .unwrap();
        let unscoped = db.unscoped();
        assert!(
            unscoped
                .find(Query::from("sales_orders").include(Include::new("customer")))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn permissive_mode_runs_unfiltered() {
        let db = db(IsolationMode::Permissive);
        db.open_session(TenantId::generate())
            .create("customers", record(json!({"name": "A"})))
            .await
            .unwrap();
        db.open_session(TenantId::generate())
            .create("customers", record(json!({"name": "B"})))
            .await
            .unwrap();

        let all = db.unscoped().find(Query::from("customers")).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn bypass_reads_across_tenants_for_one_call() {
        let db = db(IsolationMode::Strict);
        let s1 = db.open_session(TenantId::generate());
        let s2 = db.open_session(TenantId::generate());
        s1.create("customers", record(json!({"name": "A"})))
            .await
            .unwrap();
        s2.create("customers", record(json!({"name": "B"})))
            .await
            .unwrap();

        let all = s1
            .bypass(BypassGrant::new("test: cross-tenant aggregate"))
            .find(Query::from("customers"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        // The session itself is unchanged.
        assert_eq!(s1.find(Query::from("customers")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_tables_and_associations_are_errors() {
        let db = db(IsolationMode::Permissive);
        let s = db.open_session(TenantId::generate());
        assert!(matches!(
            s.find(Query::from("payroll")).await,
            Err(TenancyError::UnknownTable(_))
        ));
        assert!(matches!(
            s.find(Query::from("customers").include(Include::new("invoices")))
                .await,
            Err(TenancyError::UnknownAssociation { .. })
        ));
        assert!(matches!(
            s.bypass(BypassGrant::new("test: unknown table"))
                .find(Query::from("payroll"))
                .await,
            Err(TenancyError::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_sessions_stay_isolated() {
        let db = db(IsolationMode::Strict);
        let tenants: Vec<TenantId> = (0..8).map(|_| TenantId::generate()).collect();

        let mut handles = Vec::new();
        for tenant in tenants.clone() {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let s = db.open_session(tenant);
                for i in 0..5 {
                    s.create("products", record(json!({"sku": format!("sku-{i}"), "name": "p"})))
                        .await
                        .unwrap();
                }
                s.find(Query::from("products")).await.unwrap()
            }));
        }

        for (handle, tenant) in handles.into_iter().zip(tenants) {
            let rows = handle.await.unwrap();
            assert_eq!(rows.len(), 5);
            let expected = tenant.to_string();
            assert!(rows.iter().all(|r| tenant_of(r) == Some(expected.as_str())));
        }
    }
}
