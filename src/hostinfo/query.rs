//! Sea-query builders for the cluster system tables.

use sea_query::{Alias, Cond, Expr, Func, Iden, Order, Query, SelectStatement, SimpleExpr};

use crate::topology::ComponentKind;

/// Instance kinds whose reports win when hosts disagree, lowest priority first.
///
/// Rows are ordered by this list descending, so later entries are merged first.
pub const SORT_ORDER: [ComponentKind; 7] = [
    ComponentKind::ColumnarStore,
    ComponentKind::KvStore,
    ComponentKind::Coordinator,
    ComponentKind::SqlEngine,
    ComponentKind::SqlProxy,
    ComponentKind::TsoNode,
    ComponentKind::Scheduler,
];

/// Config key that points at the data (or log) directory of each kind.
pub const MOUNT_CONFIG_KEYS: [(ComponentKind, &str); 4] = [
    (ComponentKind::SqlEngine, "log.file.filename"),
    (ComponentKind::KvStore, "storage.data-dir"),
    (ComponentKind::Coordinator, "data-dir"),
    (ComponentKind::ColumnarStore, "engine-store.path"),
];

/// Shared columns of `CLUSTER_HARDWARE`, `CLUSTER_LOAD` and `CLUSTER_CONFIG`.
#[derive(Iden)]
pub enum ClusterColumn {
    #[iden = "TYPE"]
    Type,
    #[iden = "INSTANCE"]
    Instance,
    #[iden = "DEVICE_TYPE"]
    DeviceType,
    #[iden = "DEVICE_NAME"]
    DeviceName,
    #[iden = "NAME"]
    Name,
    #[iden = "VALUE"]
    Value,
    #[iden = "KEY"]
    Key,
    #[iden = "JSON_VALUE"]
    JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterTable {
    Hardware,
    Load,
    Config,
}

impl ClusterTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            ClusterTable::Hardware => "CLUSTER_HARDWARE",
            ClusterTable::Load => "CLUSTER_LOAD",
            ClusterTable::Config => "CLUSTER_CONFIG",
        }
    }
}

/// Rank used by the row ordering; kinds outside [`SORT_ORDER`] rank 0.
pub fn sort_rank(instance_type: &str) -> usize {
    ComponentKind::from_sql_type_name(instance_type)
        .and_then(|kind| SORT_ORDER.iter().position(|k| *k == kind))
        .map(|pos| pos + 1)
        .unwrap_or(0)
}

fn sort_order_expr() -> SimpleExpr {
    let names = SORT_ORDER
        .iter()
        .filter_map(|kind| kind.sql_type_name())
        .map(|name| format!("'{}'", name))
        .collect::<Vec<_>>()
        .join(", ");
    Expr::cust(format!("FIELD(LOWER(`TYPE`), {})", names))
}

/// One row per (type, instance, device) with all name/value pairs folded
/// into a JSON object.
pub fn device_rows_query(table: ClusterTable, device_types: &[&str]) -> SelectStatement {
    Query::select()
        .columns([
            ClusterColumn::Type,
            ClusterColumn::Instance,
            ClusterColumn::DeviceType,
            ClusterColumn::DeviceName,
        ])
        .expr_as(
            Expr::cust("CAST(JSON_OBJECTAGG(`NAME`, `VALUE`) AS CHAR)"),
            ClusterColumn::JsonValue,
        )
        .from((Alias::new("INFORMATION_SCHEMA"), Alias::new(table.table_name())))
        .and_where(
            Expr::col(ClusterColumn::DeviceType)
                .is_in(device_types.iter().map(|t| (*t).to_owned())),
        )
        .group_by_columns([
            ClusterColumn::Type,
            ClusterColumn::Instance,
            ClusterColumn::DeviceType,
            ClusterColumn::DeviceName,
        ])
        .order_by_expr(sort_order_expr(), Order::Desc)
        .order_by(ClusterColumn::Instance, Order::Asc)
        .order_by(ClusterColumn::DeviceType, Order::Asc)
        .order_by(ClusterColumn::DeviceName, Order::Asc)
        .to_owned()
}

/// Data-directory config entries of every instance.
pub fn instance_mounts_query() -> SelectStatement {
    let mut any = Cond::any();
    for (kind, key) in MOUNT_CONFIG_KEYS {
        if let Some(type_name) = kind.sql_type_name() {
            any = any.add(
                Cond::all()
                    .add(Expr::expr(Func::lower(Expr::col(ClusterColumn::Type))).eq(type_name))
                    .add(Expr::col(ClusterColumn::Key).eq(key)),
            );
        }
    }
    Query::select()
        .columns([
            ClusterColumn::Type,
            ClusterColumn::Instance,
            ClusterColumn::Key,
            ClusterColumn::Value,
        ])
        .from((
            Alias::new("INFORMATION_SCHEMA"),
            Alias::new(ClusterTable::Config.table_name()),
        ))
        .cond_where(any)
        .order_by(ClusterColumn::Instance, Order::Asc)
        .to_owned()
}
