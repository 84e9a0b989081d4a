//! Executed scripts ledger.
//!
//! The ledger is a table in the default database with one row per executed
//! script. Every read goes to the database, so a fresh
//! [`DbExecutedScriptInfoSource`] always sees the changes made by another
//! one.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::database::{Database, DbItemType, SqlValue};
use crate::error::{MaintainError, Result};
use crate::script::{Script, ScriptFactory};

/// A script as it was when it was executed.
#[derive(Debug, Clone)]
pub struct ExecutedScript {
    script: Script,
    executed_at: DateTime<Utc>,
    succeeded: bool,
}

impl ExecutedScript {
    /// Creates a ledger entry for a script.
    #[must_use]
    pub fn new(script: Script, executed_at: DateTime<Utc>, succeeded: bool) -> Self {
        Self {
            script,
            executed_at,
            succeeded,
        }
    }

    /// Returns the script snapshot.
    #[must_use]
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Returns when the script was executed.
    #[must_use]
    pub fn executed_at(&self) -> DateTime<Utc> {
        self.executed_at
    }

    /// Returns whether the execution succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Returns the file name of the script.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.script.file_name()
    }
}

impl PartialEq for ExecutedScript {
    fn eq(&self, other: &Self) -> bool {
        self.script == other.script
    }
}

impl Eq for ExecutedScript {}

impl PartialOrd for ExecutedScript {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExecutedScript {
    fn cmp(&self, other: &Self) -> Ordering {
        self.script.cmp(&other.script)
    }
}

/// Access to the record of executed scripts.
#[async_trait]
pub trait ExecutedScriptInfoSource: Send + Sync {
    /// Returns all executed scripts in script order.
    async fn executed_scripts(&self) -> Result<Vec<ExecutedScript>>;

    /// Records a script that was not recorded before.
    async fn register(&self, executed: &ExecutedScript) -> Result<()>;

    /// Replaces the record of a script.
    async fn update(&self, executed: &ExecutedScript) -> Result<()>;

    /// Moves the record of `from` to the name, checksum and modification
    /// date of `to`.
    async fn rename(&self, from: &str, to: &Script) -> Result<()>;

    /// Removes the record of a script.
    async fn delete(&self, file_name: &str) -> Result<()>;

    /// Removes the records of all postprocessing scripts.
    async fn delete_all_post_processing(&self) -> Result<()>;

    /// Removes every record.
    async fn clear_all(&self) -> Result<()>;

    /// Marks every failed script as successfully executed.
    async fn mark_error_scripts_as_successful(&self) -> Result<()>;

    /// Removes the records of every failed script.
    async fn remove_error_scripts(&self) -> Result<()>;
}

/// Ledger stored in a table of the default database.
pub struct DbExecutedScriptInfoSource {
    database: Arc<dyn Database>,
    config: LedgerConfig,
    factory: ScriptFactory,
    table_checked: AtomicBool,
}

impl DbExecutedScriptInfoSource {
    /// Creates a ledger stored in `database`. Rows are turned back into
    /// scripts with `factory`.
    #[must_use]
    pub fn new(database: Arc<dyn Database>, config: LedgerConfig, factory: ScriptFactory) -> Self {
        Self {
            database,
            config,
            factory,
            table_checked: AtomicBool::new(false),
        }
    }

    /// Returns the name of the ledger table.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.config.table_name
    }

    /// Returns the statement that creates the ledger table.
    #[must_use]
    pub fn create_table_statement(&self) -> String {
        let db = &self.database;
        let c = &self.config;
        format!(
            "CREATE TABLE {} ({} VARCHAR(150), {} BIGINT, {} VARCHAR(64), {} VARCHAR(40), {} INTEGER)",
            self.qualified_table(),
            db.quote(&c.file_name_column),
            db.quote(&c.file_last_modified_at_column),
            db.quote(&c.checksum_column),
            db.quote(&c.executed_at_column),
            db.quote(&c.succeeded_column),
        )
    }

    fn qualified_table(&self) -> String {
        self.database
            .qualified(self.database.default_schema(), &self.config.table_name)
    }

    fn column(&self, name: &str) -> String {
        self.database.quote(name)
    }

    /// Checks that the ledger table exists, creating it when allowed.
    pub async fn ensure_table(&self) -> Result<()> {
        if self.table_checked.load(AtomicOrdering::Acquire) {
            return Ok(());
        }
        let case = self.database.identifier_case();
        let wanted = case.normalize_stored(&self.config.table_name);
        let exists = self
            .database
            .item_names(self.database.default_schema(), DbItemType::Table)
            .await?
            .iter()
            .any(|name| case.normalize_stored(name) == wanted);

        if !exists {
            if !self.config.auto_create {
                return Err(MaintainError::LedgerTableMissing {
                    table: self.config.table_name.clone(),
                    create_statement: self.create_table_statement(),
                });
            }
            info!(table = %self.config.table_name, "Creating executed scripts table");
            self.database
                .sql_handler()
                .execute(&self.create_table_statement())
                .await?;
        }
        self.table_checked.store(true, AtomicOrdering::Release);
        Ok(())
    }

    fn format_timestamp(&self, timestamp: DateTime<Utc>) -> String {
        timestamp.format(&self.config.timestamp_format).to_string()
    }

    fn parse_row(&self, row: &[SqlValue]) -> Result<ExecutedScript> {
        let text = |index: usize| row.get(index).and_then(SqlValue::as_text);
        let file_name =
            text(0).ok_or_else(|| MaintainError::InvalidLedgerRow("missing file name".to_string()))?;
        let last_modified_at = row.get(1).and_then(SqlValue::as_i64).unwrap_or(0);
        let checksum = text(2).unwrap_or_default();
        let executed_at = match text(3) {
            Some(value) => NaiveDateTime::parse_from_str(&value, &self.config.timestamp_format)
                .map(|dt| dt.and_utc())
                .map_err(|e| {
                    MaintainError::InvalidLedgerRow(format!(
                        "invalid execution date '{}' for '{}': {}",
                        value, file_name, e
                    ))
                })?,
            None => DateTime::<Utc>::default(),
        };
        let succeeded = row.get(4).and_then(SqlValue::as_i64).unwrap_or(0) != 0;
        let script = self
            .factory
            .create_executed_snapshot(&file_name, last_modified_at, checksum)?;
        Ok(ExecutedScript::new(script, executed_at, succeeded))
    }
}

#[async_trait]
impl ExecutedScriptInfoSource for DbExecutedScriptInfoSource {
    async fn executed_scripts(&self) -> Result<Vec<ExecutedScript>> {
        self.ensure_table().await?;
        let c = &self.config;
        let sql = format!(
            "SELECT {}, {}, {}, {}, {} FROM {}",
            self.column(&c.file_name_column),
            self.column(&c.file_last_modified_at_column),
            self.column(&c.checksum_column),
            self.column(&c.executed_at_column),
            self.column(&c.succeeded_column),
            self.qualified_table(),
        );
        let mut scripts = self
            .database
            .sql_handler()
            .query_rows(&sql)
            .await?
            .iter()
            .map(|row| self.parse_row(row))
            .collect::<Result<Vec<_>>>()?;
        scripts.sort();
        Ok(scripts)
    }

    async fn register(&self, executed: &ExecutedScript) -> Result<()> {
        self.ensure_table().await?;
        debug!(file_name = %executed.file_name(), succeeded = executed.succeeded(), "Registering script");
        let c = &self.config;
        let script = executed.script();
        let sql = format!(
            "INSERT INTO {} ({}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?)",
            self.qualified_table(),
            self.column(&c.file_name_column),
            self.column(&c.file_last_modified_at_column),
            self.column(&c.checksum_column),
            self.column(&c.executed_at_column),
            self.column(&c.succeeded_column),
        );
        let params = [
            SqlValue::Text(script.file_name().to_string()),
            SqlValue::Integer(script.last_modified_at()),
            SqlValue::Text(script.checksum().to_string()),
            SqlValue::Text(self.format_timestamp(executed.executed_at())),
            SqlValue::Integer(i64::from(executed.succeeded())),
        ];
        self.database.sql_handler().execute_with(&sql, &params).await?;
        Ok(())
    }

    async fn update(&self, executed: &ExecutedScript) -> Result<()> {
        self.ensure_table().await?;
        debug!(file_name = %executed.file_name(), succeeded = executed.succeeded(), "Updating script");
        let c = &self.config;
        let script = executed.script();
        let sql = format!(
            "UPDATE {} SET {} = ?, {} = ?, {} = ?, {} = ? WHERE {} = ?",
            self.qualified_table(),
            self.column(&c.file_last_modified_at_column),
            self.column(&c.checksum_column),
            self.column(&c.executed_at_column),
            self.column(&c.succeeded_column),
            self.column(&c.file_name_column),
        );
        let params = [
            SqlValue::Integer(script.last_modified_at()),
            SqlValue::Text(script.checksum().to_string()),
            SqlValue::Text(self.format_timestamp(executed.executed_at())),
            SqlValue::Integer(i64::from(executed.succeeded())),
            SqlValue::Text(script.file_name().to_string()),
        ];
        self.database.sql_handler().execute_with(&sql, &params).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &Script) -> Result<()> {
        self.ensure_table().await?;
        info!(from = %from, to = %to.file_name(), "Renaming executed script");
        let c = &self.config;
        let sql = format!(
            "UPDATE {} SET {} = ?, {} = ?, {} = ? WHERE {} = ?",
            self.qualified_table(),
            self.column(&c.file_name_column),
            self.column(&c.file_last_modified_at_column),
            self.column(&c.checksum_column),
            self.column(&c.file_name_column),
        );
        let params = [
            SqlValue::Text(to.file_name().to_string()),
            SqlValue::Integer(to.last_modified_at()),
            SqlValue::Text(to.checksum().to_string()),
            SqlValue::Text(from.to_string()),
        ];
        self.database.sql_handler().execute_with(&sql, &params).await?;
        Ok(())
    }

    async fn delete(&self, file_name: &str) -> Result<()> {
        self.ensure_table().await?;
        debug!(file_name = %file_name, "Deleting executed script");
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.qualified_table(),
            self.column(&self.config.file_name_column),
        );
        self.database
            .sql_handler()
            .execute_with(&sql, &[SqlValue::Text(file_name.to_string())])
            .await?;
        Ok(())
    }

    async fn delete_all_post_processing(&self) -> Result<()> {
        for executed in self.executed_scripts().await? {
            if executed.script().is_post_processing() {
                self.delete(executed.file_name()).await?;
            }
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.ensure_table().await?;
        info!(table = %self.config.table_name, "Clearing executed scripts");
        let sql = format!("DELETE FROM {}", self.qualified_table());
        self.database.sql_handler().execute(&sql).await?;
        Ok(())
    }

    async fn mark_error_scripts_as_successful(&self) -> Result<()> {
        self.ensure_table().await?;
        let column = self.column(&self.config.succeeded_column);
        let sql = format!(
            "UPDATE {} SET {} = 1 WHERE {} = 0",
            self.qualified_table(),
            column,
            column
        );
        let count = self.database.sql_handler().execute(&sql).await?;
        info!(count, "Marked failed scripts as successful");
        Ok(())
    }

    async fn remove_error_scripts(&self) -> Result<()> {
        self.ensure_table().await?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = 0",
            self.qualified_table(),
            self.column(&self.config.succeeded_column)
        );
        let count = self.database.sql_handler().execute(&sql).await?;
        info!(count, "Removed failed scripts");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, ScriptConfig};
    use crate::database::SqliteDatabase;

    fn create_test_database() -> Arc<dyn Database> {
        Arc::new(SqliteDatabase::new(&DatabaseConfig::sqlite_memory("main")).unwrap())
    }

    fn factory() -> ScriptFactory {
        ScriptFactory::new(&ScriptConfig::default()).unwrap()
    }

    fn ledger(database: &Arc<dyn Database>) -> DbExecutedScriptInfoSource {
        DbExecutedScriptInfoSource::new(database.clone(), LedgerConfig::default(), factory())
    }

    fn executed(name: &str, content: &str, succeeded: bool) -> ExecutedScript {
        let script = factory().create_from_text(name, content, 42).unwrap();
        ExecutedScript::new(script, Utc::now(), succeeded)
    }

    #[tokio::test]
    async fn test_round_trip_through_fresh_instance() {
        let db = create_test_database();
        let first = ledger(&db);
        let failed = executed("1_a.sql", "a", false);
        first.register(&executed("2_b.sql", "b", true)).await.unwrap();
        first.register(&failed).await.unwrap();
        first.register(&executed("views.sql", "v", true)).await.unwrap();

        let second = ledger(&db);
        let scripts = second.executed_scripts().await.unwrap();
        let names: Vec<&str> = scripts.iter().map(ExecutedScript::file_name).collect();
        assert_eq!(names, vec!["1_a.sql", "2_b.sql", "views.sql"]);
        assert!(!scripts[0].succeeded());
        assert_eq!(scripts[0].executed_at(), failed.executed_at());
        assert_eq!(scripts[0].script().last_modified_at(), 42);
        assert_eq!(
            scripts[0].script().checksum(),
            crate::script::compute_checksum(b"a")
        );

        second.update(&executed("1_a.sql", "a2", true)).await.unwrap();
        second.delete("views.sql").await.unwrap();

        let scripts = ledger(&db).executed_scripts().await.unwrap();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].succeeded());
        assert_eq!(
            scripts[0].script().checksum(),
            crate::script::compute_checksum(b"a2")
        );
    }

    #[tokio::test]
    async fn test_seconds_only_timestamps_still_parse() {
        let db = create_test_database();
        let config = LedgerConfig {
            timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            ..LedgerConfig::default()
        };
        let old = DbExecutedScriptInfoSource::new(db.clone(), config, factory());
        old.register(&executed("1_a.sql", "a", true)).await.unwrap();

        let scripts = ledger(&db).executed_scripts().await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].executed_at().timestamp_subsec_nanos(), 0);
    }

    #[tokio::test]
    async fn test_names_with_quotes_are_stored_verbatim() {
        let db = create_test_database();
        let ledger = ledger(&db);
        ledger.register(&executed("1_o'brien.sql", "a", false)).await.unwrap();
        ledger.update(&executed("1_o'brien.sql", "a2", true)).await.unwrap();

        let scripts = ledger.executed_scripts().await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].file_name(), "1_o'brien.sql");
        assert!(scripts[0].succeeded());

        let renamed = factory().create_from_text("1_o''neil.sql", "a2", 42).unwrap();
        ledger.rename("1_o'brien.sql", &renamed).await.unwrap();
        let scripts = ledger.executed_scripts().await.unwrap();
        assert_eq!(scripts[0].file_name(), "1_o''neil.sql");

        ledger.delete("1_o''neil.sql").await.unwrap();
        assert!(ledger.executed_scripts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename() {
        let db = create_test_database();
        let ledger = ledger(&db);
        ledger.register(&executed("1_a.sql", "a", true)).await.unwrap();

        let renamed = factory().create_from_text("01_a_renamed.sql", "a", 7).unwrap();
        ledger.rename("1_a.sql", &renamed).await.unwrap();

        let scripts = ledger.executed_scripts().await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].file_name(), "01_a_renamed.sql");
        assert_eq!(scripts[0].script().last_modified_at(), 7);
        assert!(scripts[0].succeeded());
    }

    #[tokio::test]
    async fn test_delete_all_post_processing_and_clear() {
        let db = create_test_database();
        let ledger = ledger(&db);
        ledger.register(&executed("1_a.sql", "a", true)).await.unwrap();
        ledger
            .register(&executed("postprocessing/grants.sql", "g", true))
            .await
            .unwrap();

        ledger.delete_all_post_processing().await.unwrap();
        let scripts = ledger.executed_scripts().await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].file_name(), "1_a.sql");

        ledger.clear_all().await.unwrap();
        assert!(ledger.executed_scripts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_script_resolution() {
        let db = create_test_database();
        let ledger = ledger(&db);
        ledger.register(&executed("1_a.sql", "a", true)).await.unwrap();
        ledger.register(&executed("2_b.sql", "b", false)).await.unwrap();

        ledger.mark_error_scripts_as_successful().await.unwrap();
        assert!(ledger
            .executed_scripts()
            .await
            .unwrap()
            .iter()
            .all(ExecutedScript::succeeded));

        ledger.register(&executed("3_c.sql", "c", false)).await.unwrap();
        ledger.remove_error_scripts().await.unwrap();
        let names: Vec<String> = ledger
            .executed_scripts()
            .await
            .unwrap()
            .iter()
            .map(|s| s.file_name().to_string())
            .collect();
        assert_eq!(names, vec!["1_a.sql", "2_b.sql"]);
    }

    #[tokio::test]
    async fn test_missing_table_without_auto_create() {
        let db = create_test_database();
        let config = LedgerConfig {
            auto_create: false,
            ..LedgerConfig::default()
        };
        let ledger = DbExecutedScriptInfoSource::new(db, config, factory());

        match ledger.executed_scripts().await {
            Err(MaintainError::LedgerTableMissing {
                table,
                create_statement,
            }) => {
                assert_eq!(table, "dbmaintain_scripts");
                assert!(create_statement.starts_with("CREATE TABLE"));
                assert!(create_statement.contains("\"checksum\""));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_existing_table_is_used() {
        let db = create_test_database();
        let ledger = ledger(&db);
        db.sql_handler()
            .execute(&ledger.create_table_statement())
            .await
            .unwrap();

        let strict = DbExecutedScriptInfoSource::new(
            db.clone(),
            LedgerConfig {
                auto_create: false,
                ..LedgerConfig::default()
            },
            factory(),
        );
        assert!(strict.executed_scripts().await.unwrap().is_empty());
    }
}
