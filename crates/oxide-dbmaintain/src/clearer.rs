//! Dropping every database object that is not preserved.
//!
//! Objects are dropped per schema, category by category in
//! [`DbItemType::DROP_ORDER`]. A failing drop doesn't stop the pass; failed
//! objects are retried in the next pass as long as the number of failures
//! keeps going down (see [`MultiPassErrorHandler`]).

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::config::PreserveConfig;
use crate::database::{Database, DbItemIdentifier, DbItemType, Databases};
use crate::error::Result;
use crate::multipass::MultiPassErrorHandler;
use crate::preserve::PreservedItems;

/// Drops all database objects except the preserved ones and the executed
/// scripts table.
pub struct DbClearer {
    databases: Databases,
    preserved: PreservedItems,
}

impl DbClearer {
    /// Creates a clearer. Preserve entries are parsed and normalized now;
    /// their existence is checked by [`clear_database`](Self::clear_database).
    pub fn new(databases: Databases, preserve: &PreserveConfig, ledger_table: &str) -> Result<Self> {
        let mut preserved = PreservedItems::new();
        preserved.add_schemas(&preserve.schemas, &databases)?;
        for (item_type, names) in [
            (DbItemType::Table, &preserve.tables),
            (DbItemType::View, &preserve.views),
            (DbItemType::MaterializedView, &preserve.materialized_views),
            (DbItemType::Synonym, &preserve.synonyms),
            (DbItemType::Sequence, &preserve.sequences),
            (DbItemType::Trigger, &preserve.triggers),
            (DbItemType::Type, &preserve.types),
        ] {
            preserved.add_items(item_type, names, &databases)?;
        }
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

    /// Drops every object that is not preserved, in all schemas of all
    /// databases.
    ///
    /// Fails before dropping anything when a preserved schema or object
    /// doesn't exist.
    pub async fn clear_database(&self) -> Result<()> {
        self.preserved.validate(&self.databases).await?;

        let mut handler = MultiPassErrorHandler::new();
        let mut pass = 1;
        loop {
            info!(pass, "Clearing database");
            for database in self.databases.iter() {
                for schema in database.schema_names() {
                    if self.preserved.is_schema_preserved(database.as_ref(), schema) {
                        debug!(database = %database.name(), schema = %schema, "Schema preserved");
                        continue;
                    }
                    self.clear_schema(database.as_ref(), schema, &mut handler)
                        .await?;
                }
            }
            if !handler.continue_execution_after_pass()? {
                break;
            }
            pass += 1;
        }
        Ok(())
    }

    async fn clear_schema(
        &self,
        database: &dyn Database,
        schema: &str,
        handler: &mut MultiPassErrorHandler,
    ) -> Result<()> {
        for item_type in DbItemType::DROP_ORDER {
            if !database.supports(item_type) {
                continue;
            }
            let names = database.item_names(schema, item_type).await?;
            let names = if item_type == DbItemType::Table {
                table_drop_order(database, schema, names).await?
            } else {
                names.into_iter().collect()
            };

            for name in names {
                if self
                    .preserved
                    .is_item_preserved(database, schema, item_type, &name)
                {
                    continue;
                }
                match database.drop_item(schema, item_type, &name).await {
                    Ok(()) => {
                        debug!(database = %database.name(), schema = %schema, item_type = %item_type, name = %name, "Dropped");
                    }
                    Err(e) => {
                        warn!(database = %database.name(), schema = %schema, item_type = %item_type, name = %name, error = %e, "Drop failed");
                        handler.add_error(e);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Orders the tables of a schema so that tables referencing others come
/// first. Without foreign key metadata the names are returned as listed.
pub(crate) async fn table_drop_order(
    database: &dyn Database,
    schema: &str,
    tables: BTreeSet<String>,
) -> Result<Vec<String>> {
    let mut ordered: Vec<String> = tables.into_iter().collect();
    if let Some(dependencies) = database.table_dependencies(schema).await? {
        sort_parents_first(&mut ordered, &dependencies);
        ordered.reverse();
    }
    Ok(ordered)
}

/// Adjacent-swap sort moving referenced tables before the tables that
/// reference them. The comparison is not transitive, so this is not a
/// topological sort; cycles are left to the multi-pass retry.
fn sort_parents_first(tables: &mut [String], dependencies: &HashMap<String, BTreeSet<String>>) {
    let references = |child: &str, parent: &str| {
        dependencies
            .get(child)
            .is_some_and(|parents| parents.contains(parent))
    };
    let len = tables.len();
    for _ in 0..len {
        let mut swapped = false;
        for i in 0..len.saturating_sub(1) {
            if references(&tables[i], &tables[i + 1]) && !references(&tables[i + 1], &tables[i]) {
                tables.swap(i, i + 1);
                swapped = true;
            }
        }
        if !swapped {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::config::DatabaseConfig;
    use crate::database::{Dialect, IdentifierCase, SqlHandler, SqlValue, SqliteDatabase};
    use crate::error::MaintainError;

    /// Statement handler that accepts everything and returns nothing.
    struct NoopSqlHandler;

    #[async_trait]
    impl SqlHandler for NoopSqlHandler {
        async fn execute_with(&self, _sql: &str, _params: &[SqlValue]) -> Result<u64> {
            Ok(0)
        }

        async fn execute_script(&self, _sql: &str) -> Result<()> {
            Ok(())
        }

        async fn query_rows_with(
            &self,
            _sql: &str,
            _params: &[SqlValue],
        ) -> Result<Vec<Vec<SqlValue>>> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// In-memory database whose tables can't be dropped while a table
    /// referencing them still exists. Listing returns the parents first so
    /// that the first pass always hits failures.
    struct FakeDatabase {
        handler: NoopSqlHandler,
        schemas: Vec<String>,
        tables: Mutex<Vec<(String, Option<String>)>>,
        views: Mutex<BTreeSet<String>>,
        dropped: Mutex<Vec<String>>,
    }

    impl FakeDatabase {
        fn new(tables: &[(&str, Option<&str>)], views: &[&str]) -> Self {
            Self {
                handler: NoopSqlHandler,
                schemas: vec!["main".to_string()],
                tables: Mutex::new(
                    tables
                        .iter()
                        .map(|(name, parent)| (name.to_string(), parent.map(str::to_string)))
                        .collect(),
                ),
                views: Mutex::new(views.iter().map(|v| v.to_string()).collect()),
                dropped: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Database for FakeDatabase {
        fn name(&self) -> &str {
            "main"
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
            matches!(item_type, DbItemType::Table | DbItemType::View)
        }

        async fn schema_exists(&self, schema: &str) -> Result<bool> {
            Ok(schema == "main")
        }

        async fn item_names(&self, _schema: &str, item_type: DbItemType) -> Result<BTreeSet<String>> {
            Ok(match item_type {
                DbItemType::Table => self
                    .tables
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(name, _)| name.clone())
                    .collect(),
                DbItemType::View => self.views.lock().unwrap().clone(),
                _ => BTreeSet::new(),
            })
        }

        async fn drop_item(&self, _schema: &str, item_type: DbItemType, name: &str) -> Result<()> {
            match item_type {
                DbItemType::Table => {
                    let mut tables = self.tables.lock().unwrap();
                    if tables
                        .iter()
                        .any(|(_, parent)| parent.as_deref() == Some(name))
                    {
                        return Err(MaintainError::config(format!("{} is still referenced", name)));
                    }
                    tables.retain(|(table, _)| table != name);
                }
                _ => {
                    self.views.lock().unwrap().remove(name);
                }
            }
            self.dropped.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn disable_referential_constraints(&self, _schema: &str) -> Result<()> {
            Ok(())
        }

        async fn disable_value_constraints(&self, _schema: &str) -> Result<()> {
            Ok(())
        }
    }

    fn fake_databases(fake: &Arc<FakeDatabase>) -> Databases {
        Databases::new(vec![fake.clone() as Arc<dyn Database>]).unwrap()
    }

    #[test]
    fn test_sort_parents_first() {
        let mut tables = vec!["a_child".to_string(), "b_parent".to_string(), "c".to_string()];
        let deps = HashMap::from([(
            "a_child".to_string(),
            BTreeSet::from(["b_parent".to_string()]),
        )]);
        sort_parents_first(&mut tables, &deps);
        assert_eq!(tables, vec!["b_parent", "a_child", "c"]);
    }

    #[test]
    fn test_sort_with_cycle_terminates() {
        let mut tables = vec!["a".to_string(), "b".to_string()];
        let deps = HashMap::from([
            ("a".to_string(), BTreeSet::from(["b".to_string()])),
            ("b".to_string(), BTreeSet::from(["a".to_string()])),
        ]);
        sort_parents_first(&mut tables, &deps);
        assert_eq!(tables.len(), 2);
    }

    #[tokio::test]
    async fn test_multi_pass_drop_converges() {
        // a <- b <- c: listing order drops nothing but c in the first pass.
        let fake = Arc::new(FakeDatabase::new(
            &[("a", None), ("b", Some("a")), ("c", Some("b"))],
            &["v"],
        ));
        let clearer =
            DbClearer::new(fake_databases(&fake), &PreserveConfig::default(), "dbmaintain_scripts")
                .unwrap();

        clearer.clear_database().await.unwrap();
        assert!(fake.tables.lock().unwrap().is_empty());
        assert!(fake.views.lock().unwrap().is_empty());
        assert_eq!(*fake.dropped.lock().unwrap(), vec!["v", "c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_multi_pass_drop_without_progress_fails() {
        // x is referenced by a table that is preserved, so it can never go.
        let fake = Arc::new(FakeDatabase::new(&[("keep", Some("x")), ("x", None)], &[]));
        let preserve = PreserveConfig {
            tables: vec!["keep".to_string()],
            ..PreserveConfig::default()
        };
        let clearer = DbClearer::new(fake_databases(&fake), &preserve, "dbmaintain_scripts").unwrap();

        let err = clearer.clear_database().await.unwrap_err();
        assert!(err.to_string().contains("x is still referenced"));
    }

    #[tokio::test]
    async fn test_missing_preserved_items_fail_before_any_drop() {
        let fake = Arc::new(FakeDatabase::new(&[("a", None)], &["v"]));

        let preserve = PreserveConfig {
            tables: vec!["missing".to_string()],
            ..PreserveConfig::default()
        };
        let clearer = DbClearer::new(fake_databases(&fake), &preserve, "dbmaintain_scripts").unwrap();
        assert!(matches!(
            clearer.clear_database().await,
            Err(MaintainError::PreservedItemNotFound { .. })
        ));

        let preserve = PreserveConfig {
            schemas: vec!["reporting".to_string()],
            ..PreserveConfig::default()
        };
        let clearer = DbClearer::new(fake_databases(&fake), &preserve, "dbmaintain_scripts").unwrap();
        assert!(matches!(
            clearer.clear_database().await,
            Err(MaintainError::PreservedSchemaNotFound { .. })
        ));

        assert!(fake.dropped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preserved_schema_is_skipped() {
        let fake = Arc::new(FakeDatabase::new(&[("a", None)], &["v"]));
        let preserve = PreserveConfig {
            schemas: vec!["MAIN".to_string()],
            ..PreserveConfig::default()
        };
        let clearer = DbClearer::new(fake_databases(&fake), &preserve, "dbmaintain_scripts").unwrap();
        clearer.clear_database().await.unwrap();
        assert!(fake.dropped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_sqlite_database() {
        let db: Arc<dyn Database> =
            Arc::new(SqliteDatabase::new(&DatabaseConfig::sqlite_memory("main")).unwrap());
        db.sql_handler()
            .execute_script(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY);
                 CREATE TABLE child (id INTEGER, parent_id INTEGER REFERENCES parent(id));
                 INSERT INTO parent VALUES (1);
                 INSERT INTO child VALUES (1, 1);
                 CREATE TABLE audit_log (id INTEGER);
                 CREATE TABLE sqliteXlog (id INTEGER);
                 CREATE TABLE dbmaintain_scripts (file_name TEXT);
                 CREATE VIEW children AS SELECT * FROM child;
                 CREATE TRIGGER child_insert AFTER INSERT ON child BEGIN SELECT 1; END;",
            )
            .await
            .unwrap();

        let preserve = PreserveConfig {
            tables: vec!["Audit_Log".to_string()],
            ..PreserveConfig::default()
        };
        let databases = Databases::new(vec![db.clone()]).unwrap();
        let clearer = DbClearer::new(databases, &preserve, "dbmaintain_scripts").unwrap();
        clearer.clear_database().await.unwrap();

        let tables = db.item_names("main", DbItemType::Table).await.unwrap();
        assert_eq!(
            tables,
            BTreeSet::from(["audit_log".to_string(), "dbmaintain_scripts".to_string()])
        );
        assert!(db.item_names("main", DbItemType::View).await.unwrap().is_empty());
        assert!(db.item_names("main", DbItemType::Trigger).await.unwrap().is_empty());
    }
}
