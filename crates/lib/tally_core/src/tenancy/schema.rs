//! Table and association registry.
//!
//! The interceptor asks the schema whether a table (or the target of an
//! association) is tenant-scoped. Unregistered tables are rejected rather than
//! passed through.

use std::collections::BTreeMap;

use super::TenancyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// Target rows carry `foreign_key` pointing at the parent's id.
    HasMany,
    /// The parent carries `foreign_key` pointing at the target's id.
    BelongsTo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub name: String,
    pub kind: AssociationKind,
    pub target: String,
    pub foreign_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub tenant_scoped: bool,
    pub associations: Vec<Association>,
}

impl TableDef {
    /// A table whose rows each belong to one tenant.
    pub fn tenant(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant_scoped: true,
            associations: Vec::new(),
        }
    }

    /// Reference data shared by every tenant.
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant_scoped: false,
            associations: Vec::new(),
        }
    }

    pub fn has_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associate(AssociationKind::HasMany, name, target, foreign_key)
    }

    pub fn belongs_to(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associate(AssociationKind::BelongsTo, name, target, foreign_key)
    }

    fn associate(
        mut self,
        kind: AssociationKind,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associations.push(Association {
            name: name.into(),
            kind,
            target: target.into(),
            foreign_key: foreign_key.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: BTreeMap<String, TableDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, table: TableDef) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    pub fn table(&self, name: &str) -> Result<&TableDef, TenancyError> {
        self.tables
            .get(name)
            .ok_or_else(|| TenancyError::UnknownTable(name.to_string()))
    }

    pub fn association(&self, table: &str, name: &str) -> Result<&Association, TenancyError> {
        self.table(table)?
            .associations
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| TenancyError::UnknownAssociation {
                table: table.to_string(),
                association: name.to_string(),
            })
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }
}

/// Tables created by the `0002_tenant_data` migration.
pub fn business_schema() -> Schema {
    Schema::new()
        .with(TableDef::tenant("customers").has_many("orders", "sales_orders", "customer_id"))
        .with(TableDef::tenant("products").has_many("stock", "stock_levels", "product_id"))
        .with(TableDef::tenant("warehouses").has_many("stock", "stock_levels", "warehouse_id"))
        .with(
            TableDef::tenant("stock_levels")
                .belongs_to("product", "products", "product_id")
                .belongs_to("warehouse", "warehouses", "warehouse_id"),
        )
        .with(
            TableDef::tenant("sales_orders")
                .belongs_to("customer", "customers", "customer_id")
                .has_many("lines", "sales_order_lines", "order_id"),
        )
        .with(
            TableDef::tenant("sales_order_lines")
                .belongs_to("order", "sales_orders", "order_id")
                .belongs_to("product", "products", "product_id"),
        )
        .with(TableDef::global("currencies"))
}
