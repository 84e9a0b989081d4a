//! SQLite database support.
//!
//! Every attached database (`main`, `temp`, or any `ATTACH`ed file) is a
//! schema. SQLite knows tables, views and triggers; it has no sequences,
//! but `AUTOINCREMENT` tables keep their counters in `sqlite_sequence`, which
//! is treated as an identity column.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection, Executor, Row, TypeInfo, ValueRef};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::{MaintainError, Result};

use super::{Database, DbItemType, Dialect, IdentifierCase, SqlHandler, SqlValue};

/// Executes statements over one lazily opened SQLite connection.
///
/// Every statement runs on the same connection, so `BEGIN`/`COMMIT` pairs
/// and `PRAGMA`s stay in effect across calls.
pub struct SqliteSqlHandler {
    url: String,
    options: SqliteConnectOptions,
    connection: Mutex<Option<SqliteConnection>>,
}

impl SqliteSqlHandler {
    /// Creates a handler for a connection URL such as `sqlite:app.db` or
    /// `sqlite::memory:`. The connection is opened on first use.
    pub fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        Ok(Self {
            url: url.to_string(),
            options,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MappedMutexGuard<'_, SqliteConnection>> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            debug!(url = %self.url, "Opening connection");
            *guard = Some(self.options.connect().await?);
        }
        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| MaintainError::Database(sqlx::Error::PoolClosed))
    }
}

fn bind_params<'q>(sql: &'q str, params: &[SqlValue]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(value) => query.bind(*value),
        SqlValue::Real(value) => query.bind(*value),
        SqlValue::Text(value) => query.bind(value.clone()),
    })
}

fn decode_row(row: &SqliteRow) -> Result<Vec<SqlValue>> {
    let mut values = Vec::with_capacity(row.len());
    for index in 0..row.len() {
        let (is_null, type_name) = {
            let raw = row.try_get_raw(index)?;
            (raw.is_null(), raw.type_info().name().to_ascii_uppercase())
        };
        let value = if is_null {
            SqlValue::Null
        } else {
            match type_name.as_str() {
                "INTEGER" | "BIGINT" | "INT" | "BOOLEAN" => {
                    SqlValue::Integer(row.try_get_unchecked(index)?)
                }
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                    SqlValue::Real(row.try_get_unchecked(index)?)
                }
                _ => SqlValue::Text(row.try_get_unchecked(index)?),
            }
        };
        values.push(value);
    }
    Ok(values)
}

#[async_trait]
impl SqlHandler for SqliteSqlHandler {
    async fn execute_with(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut guard = self.connection().await?;
        let conn: &mut SqliteConnection = &mut guard;
        debug!(sql = %sql, params = params.len(), "Executing statement");
        let result = bind_params(sql, params).execute(conn).await?;
        Ok(result.rows_affected())
    }

    async fn execute_script(&self, sql: &str) -> Result<()> {
        let mut guard = self.connection().await?;
        let conn: &mut SqliteConnection = &mut guard;
        conn.execute(sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn query_rows_with(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let mut guard = self.connection().await?;
        let conn: &mut SqliteConnection = &mut guard;
        let rows = bind_params(sql, params).fetch_all(conn).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn close(&self) -> Result<()> {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await?;
        }
        Ok(())
    }
}

/// A SQLite database.
pub struct SqliteDatabase {
    name: String,
    schemas: Vec<String>,
    handler: SqliteSqlHandler,
}

impl SqliteDatabase {
    /// Creates the database from its configuration.
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let schemas = if config.schemas.is_empty() {
            vec!["main".to_string()]
        } else {
            config.schemas.clone()
        };
        Ok(Self {
            name: config.name.clone(),
            schemas,
            handler: SqliteSqlHandler::new(&config.url)?,
        })
    }

    fn item_type_name(item_type: DbItemType) -> Option<&'static str> {
        match item_type {
            DbItemType::Table => Some("table"),
            DbItemType::View => Some("view"),
            DbItemType::Trigger => Some("trigger"),
            _ => None,
        }
    }

    async fn has_sequence_table(&self, schema: &str) -> Result<bool> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
            self.quote(schema)
        );
        self.handler.exists(&sql).await
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn sql_handler(&self) -> &dyn SqlHandler {
        &self.handler
    }

    fn schema_names(&self) -> &[String] {
        &self.schemas
    }

    fn identifier_case(&self) -> IdentifierCase {
        IdentifierCase::Insensitive
    }

    fn supports(&self, item_type: DbItemType) -> bool {
        Self::item_type_name(item_type).is_some()
    }

    fn supports_identity_columns(&self) -> bool {
        true
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        let rows = self
            .handler
            .query_rows_with(
                "SELECT name FROM pragma_database_list WHERE name = ? COLLATE NOCASE",
                &[SqlValue::Text(schema.to_string())],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn item_names(&self, schema: &str, item_type: DbItemType) -> Result<BTreeSet<String>> {
        let Some(type_name) = Self::item_type_name(item_type) else {
            return Ok(BTreeSet::new());
        };
        let sql = format!(
            "SELECT name FROM {}.sqlite_master \
             WHERE type = '{}' AND lower(substr(name, 1, 7)) <> 'sqlite_'",
            self.quote(schema),
            type_name
        );
        Ok(self.handler.query_strings(&sql).await?.into_iter().collect())
    }

    async fn drop_item(&self, schema: &str, item_type: DbItemType, name: &str) -> Result<()> {
        let Some(type_name) = Self::item_type_name(item_type) else {
            return Err(MaintainError::config(format!(
                "sqlite does not support dropping {} '{}'",
                item_type, name
            )));
        };
        let sql = format!(
            "DROP {} IF EXISTS {}",
            type_name.to_ascii_uppercase(),
            self.qualified(schema, name)
        );
        self.handler.execute(&sql).await.map(|_| ())
    }

    async fn table_dependencies(
        &self,
        schema: &str,
    ) -> Result<Option<HashMap<String, BTreeSet<String>>>> {
        let tables = self.item_names(schema, DbItemType::Table).await?;
        let by_lower: HashMap<String, &String> =
            tables.iter().map(|t| (t.to_lowercase(), t)).collect();

        let mut dependencies = HashMap::new();
        for table in &tables {
            let sql = format!(
                "PRAGMA {}.foreign_key_list({})",
                self.quote(schema),
                self.quote(table)
            );
            let referenced: BTreeSet<String> = self
                .handler
                .query_rows(&sql)
                .await?
                .iter()
                .filter_map(|row| row.get(2).and_then(SqlValue::as_text))
                .filter_map(|name| by_lower.get(&name.to_lowercase()).map(|t| (*t).clone()))
                .filter(|name| name != table)
                .collect();
            dependencies.insert(table.clone(), referenced);
        }
        Ok(Some(dependencies))
    }

    async fn disable_referential_constraints(&self, schema: &str) -> Result<()> {
        debug!(database = %self.name, schema = %schema, "Disabling foreign keys");
        self.handler.execute("PRAGMA foreign_keys = OFF").await?;
        Ok(())
    }

    async fn disable_value_constraints(&self, schema: &str) -> Result<()> {
        // NOT NULL constraints can't be switched off in SQLite.
        debug!(database = %self.name, schema = %schema, "Disabling check constraints");
        self.handler.execute("PRAGMA ignore_check_constraints = ON").await?;
        Ok(())
    }

    async fn identity_values(&self, schema: &str) -> Result<Vec<(String, i64)>> {
        if !self.has_sequence_table(schema).await? {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT name, seq FROM {}.sqlite_sequence", self.quote(schema));
        Ok(self
            .handler
            .query_rows(&sql)
            .await?
            .into_iter()
            .filter_map(|row| {
                let name = row.first().and_then(SqlValue::as_text)?;
                let value = row.get(1).and_then(SqlValue::as_i64).unwrap_or(0);
                Some((name, value))
            })
            .collect())
    }

    async fn set_identity_value(&self, schema: &str, table: &str, value: i64) -> Result<()> {
        let sequence_table = format!("{}.sqlite_sequence", self.quote(schema));
        let params = [SqlValue::Integer(value), SqlValue::Text(table.to_string())];
        let updated = self
            .handler
            .execute_with(
                &format!("UPDATE {} SET seq = ? WHERE name = ?", sequence_table),
                &params,
            )
            .await?;
        if updated == 0 {
            self.handler
                .execute_with(
                    &format!("INSERT INTO {} (seq, name) VALUES (?, ?)", sequence_table),
                    &params,
                )
                .await?;
        }
        Ok(())
    }
}
