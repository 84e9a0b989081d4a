//! Deleting the data of every table that is not preserved.

use tracing::{debug, info, warn};

use crate::clearer::table_drop_order;
use crate::config::PreserveConfig;
use crate::database::{DbItemIdentifier, DbItemType, Databases};
use crate::error::Result;
use crate::multipass::MultiPassErrorHandler;
use crate::preserve::PreservedItems;

/// Empties all tables except those whose data is preserved.
///
/// Data is kept for the data-only preserve lists, for everything the clear
/// preserve lists name, and for the executed scripts table.
pub struct DbCleaner {
    databases: Databases,
    preserved: PreservedItems,
}

impl DbCleaner {
    /// Creates a cleaner.
    pub fn new(databases: Databases, preserve: &PreserveConfig, ledger_table: &str) -> Result<Self> {
        let mut preserved = PreservedItems::new();
        preserved.add_schemas(&preserve.schemas, &databases)?;
        preserved.add_schemas(&preserve.data_only_schemas, &databases)?;
        preserved.add_items(DbItemType::Table, &preserve.tables, &databases)?;
        preserved.add_items(DbItemType::Table, &preserve.data_only_tables, &databases)?;
        let default_db = databases.default_database().as_ref();
        preserved.add_unchecked_table(DbItemIdentifier::stored(
            default_db,
            default_db.default_schema(),
            ledger_table,
        ));
        Ok(Self {
            databases,
            preserved,
        })
    }

    /// Deletes all rows of every table that is not preserved.
    pub async fn clean_database(&self) -> Result<()> {
        self.preserved.validate(&self.databases).await?;

        let mut handler = MultiPassErrorHandler::new();
        loop {
            for database in self.databases.iter() {
                let database = database.as_ref();
                for schema in database.schema_names() {
                    if self.preserved.is_schema_preserved(database, schema) {
                        continue;
                    }
                    info!(database = %database.name(), schema = %schema, "Cleaning schema");
                    let tables = database.item_names(schema, DbItemType::Table).await?;
                    for table in table_drop_order(database, schema, tables).await? {
                        if self
                            .preserved
                            .is_item_preserved(database, schema, DbItemType::Table, &table)
                        {
                            continue;
                        }
                        match database.delete_all_rows(schema, &table).await {
                            Ok(()) => debug!(schema = %schema, table = %table, "Deleted all rows"),
                            Err(e) => {
                                warn!(schema = %schema, table = %table, error = %e, "Deleting rows failed");
                                handler.add_error(e);
                            }
                        }
                    }
                }
            }
            if !handler.continue_execution_after_pass()? {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DatabaseConfig;
    use crate::database::{Database, SqliteDatabase};
    use crate::error::MaintainError;

    async fn create_test_database() -> Arc<dyn Database> {
        let db: Arc<dyn Database> =
            Arc::new(SqliteDatabase::new(&DatabaseConfig::sqlite_memory("main")).unwrap());
        db.sql_handler()
            .execute_script(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY);
                 CREATE TABLE child (id INTEGER, parent_id INTEGER REFERENCES parent(id));
                 CREATE TABLE countries (code TEXT);
                 CREATE TABLE dbmaintain_scripts (file_name TEXT);
                 INSERT INTO parent VALUES (1);
                 INSERT INTO child VALUES (1, 1);
                 INSERT INTO countries VALUES ('BE');
                 INSERT INTO dbmaintain_scripts VALUES ('1_a.sql');",
            )
            .await
            .unwrap();
        db
    }

    async fn count(db: &Arc<dyn Database>, table: &str) -> i64 {
        db.sql_handler()
            .query_i64(&format!("SELECT COUNT(*) FROM {}", table))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_clean_keeps_preserved_data() {
        let db = create_test_database().await;
        let preserve = PreserveConfig {
            data_only_tables: vec!["countries".to_string()],
            ..PreserveConfig::default()
        };
        let cleaner = DbCleaner::new(
            Databases::new(vec![db.clone()]).unwrap(),
            &preserve,
            "dbmaintain_scripts",
        )
        .unwrap();

        cleaner.clean_database().await.unwrap();
        assert_eq!(count(&db, "parent").await, 0);
        assert_eq!(count(&db, "child").await, 0);
        assert_eq!(count(&db, "countries").await, 1);
        assert_eq!(count(&db, "dbmaintain_scripts").await, 1);
    }

    #[tokio::test]
    async fn test_clean_fails_for_missing_preserved_table() {
        let db = create_test_database().await;
        let preserve = PreserveConfig {
            data_only_tables: vec!["regions".to_string()],
            ..PreserveConfig::default()
        };
        let cleaner = DbCleaner::new(
            Databases::new(vec![db.clone()]).unwrap(),
            &preserve,
            "dbmaintain_scripts",
        )
        .unwrap();

        assert!(matches!(
            cleaner.clean_database().await,
            Err(MaintainError::PreservedItemNotFound { .. })
        ));
        assert_eq!(count(&db, "parent").await, 1);
    }
}
