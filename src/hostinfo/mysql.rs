//! Cluster tables read over the MySQL wire protocol.

use async_trait::async_trait;
use sea_query::MysqlQueryBuilder;
use sea_query_binder::SqlxBinder;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use tracing::debug;

use super::query::{device_rows_query, instance_mounts_query, ClusterTable};
use super::{ClusterConfigRow, ClusterTableRow, ClusterTableSource, Result};

pub struct MysqlClusterTables {
    pool: MySqlPool,
}

impl MysqlClusterTables {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn table_row(row: &MySqlRow) -> Result<ClusterTableRow> {
    Ok(ClusterTableRow {
        instance_type: row.try_get("TYPE")?,
        instance: row.try_get("INSTANCE")?,
        device_type: row.try_get("DEVICE_TYPE")?,
        device_name: row.try_get("DEVICE_NAME")?,
        json_value: row.try_get("JSON_VALUE")?,
    })
}

fn config_row(row: &MySqlRow) -> Result<ClusterConfigRow> {
    Ok(ClusterConfigRow {
        instance_type: row.try_get("TYPE")?,
        instance: row.try_get("INSTANCE")?,
        key: row.try_get("KEY")?,
        value: row.try_get("VALUE")?,
    })
}

#[async_trait]
impl ClusterTableSource for MysqlClusterTables {
    async fn device_rows(
        &self,
        table: ClusterTable,
        device_types: &[&str],
    ) -> Result<Vec<ClusterTableRow>> {
        let (sql, values) = device_rows_query(table, device_types).build_sqlx(MysqlQueryBuilder);
        debug!(table = table.table_name(), sql = %sql, "querying cluster table");
        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        rows.iter().map(table_row).collect()
    }

    async fn instance_mounts(&self) -> Result<Vec<ClusterConfigRow>> {
        let (sql, values) = instance_mounts_query().build_sqlx(MysqlQueryBuilder);
        debug!(sql = %sql, "querying cluster config");
        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        rows.iter().map(config_row).collect()
    }
}
