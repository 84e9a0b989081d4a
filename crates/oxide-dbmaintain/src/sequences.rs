//! Raising sequences and identity columns.
//!
//! Test data inserted with explicit ids should not collide with generated
//! ones, so every sequence and identity column below the lowest acceptable
//! value is raised to it.

use tracing::{debug, info};

use crate::database::{DbItemType, Databases};
use crate::error::Result;

/// Raises sequences and identity columns to a minimum value.
pub struct SequenceUpdater {
    databases: Databases,
    lowest_acceptable_value: i64,
}

impl SequenceUpdater {
    /// Creates an updater.
    #[must_use]
    pub fn new(databases: Databases, lowest_acceptable_value: i64) -> Self {
        Self {
            databases,
            lowest_acceptable_value,
        }
    }

    /// Raises every sequence and identity column that is below the lowest
    /// acceptable value.
    pub async fn update_sequences(&self) -> Result<()> {
        let lowest = self.lowest_acceptable_value;
        for database in self.databases.iter() {
            for schema in database.schema_names() {
                if database.supports(DbItemType::Sequence) {
                    for (name, value) in database.sequence_values(schema).await? {
                        if value < lowest {
                            debug!(schema = %schema, sequence = %name, from = value, to = lowest, "Raising sequence");
                            database.set_sequence_value(schema, &name, lowest).await?;
                        }
                    }
                }
                if database.supports_identity_columns() {
                    for (table, value) in database.identity_values(schema).await? {
                        if value < lowest {
                            debug!(schema = %schema, table = %table, from = value, to = lowest, "Raising identity column");
                            database.set_identity_value(schema, &table, lowest).await?;
                        }
                    }
                }
            }
            info!(database = %database.name(), lowest, "Updated sequences");
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
    async fn test_update_identity_columns() {
        let db: Arc<dyn Database> =
            Arc::new(SqliteDatabase::new(&DatabaseConfig::sqlite_memory("main")).unwrap());
        let sql = db.sql_handler();
        sql.execute_script(
            "CREATE TABLE low (id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT);
             CREATE TABLE high (id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT);
             INSERT INTO low (v) VALUES ('a');
             INSERT INTO high (id, v) VALUES (5000, 'b');",
        )
        .await
        .unwrap();

        SequenceUpdater::new(Databases::new(vec![db.clone()]).unwrap(), 1000)
            .update_sequences()
            .await
            .unwrap();

        let mut values = db.identity_values("main").await.unwrap();
        values.sort();
        assert_eq!(
            values,
            vec![("high".to_string(), 5000), ("low".to_string(), 1000)]
        );
    }
}
