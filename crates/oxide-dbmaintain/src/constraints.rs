//! Disabling constraints, so that tests can insert data freely.

use tracing::info;

use crate::database::Databases;
use crate::error::Result;

/// Disables foreign key, not-null and check constraints in every schema.
pub struct ConstraintsDisabler {
    databases: Databases,
}

impl ConstraintsDisabler {
    /// Creates a disabler for the given databases.
    #[must_use]
    pub fn new(databases: Databases) -> Self {
        Self { databases }
    }

    /// Disables the constraints of every schema of every database.
    pub async fn disable_constraints(&self) -> Result<()> {
        for database in self.databases.iter() {
            for schema in database.schema_names() {
                info!(database = %database.name(), schema = %schema, "Disabling constraints");
                database.disable_referential_constraints(schema).await?;
                database.disable_value_constraints(schema).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DatabaseConfig;
    use crate::database::{Database, SqliteDatabase};

    #[tokio::test]
    async fn test_disable_constraints() {
        let db: Arc<dyn Database> =
            Arc::new(SqliteDatabase::new(&DatabaseConfig::sqlite_memory("main")).unwrap());
        let sql = db.sql_handler();
        sql.execute_script(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (id INTEGER, parent_id INTEGER REFERENCES parent(id), \
             amount INTEGER CHECK (amount > 0));",
        )
        .await
        .unwrap();
        assert!(sql.execute("INSERT INTO child VALUES (1, 99, 5)").await.is_err());
        assert!(sql.execute("INSERT INTO child VALUES (1, NULL, -5)").await.is_err());

        ConstraintsDisabler::new(Databases::new(vec![db.clone()]).unwrap())
            .disable_constraints()
            .await
            .unwrap();

        sql.execute("INSERT INTO child VALUES (1, 99, 5)").await.unwrap();
        sql.execute("INSERT INTO child VALUES (2, NULL, -5)").await.unwrap();
    }
}
