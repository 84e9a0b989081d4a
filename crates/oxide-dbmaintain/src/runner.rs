//! Script execution.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::database::Databases;
use crate::error::{MaintainError, Result};
use crate::script::Script;

/// Executes the content of a script.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Executes a script against its target database.
    async fn execute(&self, script: &Script) -> Result<()>;
}

/// Runs scripts as SQL against the database named by the script, or the
/// default database.
pub struct SqlScriptRunner {
    databases: Databases,
}

impl SqlScriptRunner {
    /// Creates a runner for the given databases.
    #[must_use]
    pub fn new(databases: Databases) -> Self {
        Self { databases }
    }
}

#[async_trait]
impl ScriptRunner for SqlScriptRunner {
    async fn execute(&self, script: &Script) -> Result<()> {
        let database = self.databases.target_of(script)?;
        info!(
            file_name = %script.file_name(),
            database = %database.name(),
            "Executing script"
        );

        let wrap = |source: MaintainError| MaintainError::ScriptExecution {
            file_name: script.file_name().to_string(),
            source: Box::new(source),
        };
        let content = script.read_content().await.map_err(wrap)?;
        if content.trim().is_empty() {
            debug!(file_name = %script.file_name(), "Script is empty, skipping");
            return Ok(());
        }
        database
            .sql_handler()
            .execute_script(&content)
            .await
            .map_err(wrap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, ScriptConfig};
    use crate::script::ScriptFactory;

    fn create_test_databases() -> Databases {
        Databases::from_config(&[
            DatabaseConfig::sqlite_memory("main"),
            DatabaseConfig::sqlite_memory("users"),
        ])
        .unwrap()
    }

    fn script(name: &str, content: &str) -> Script {
        ScriptFactory::new(&ScriptConfig::default())
            .unwrap()
            .create_from_text(name, content, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_on_target_database() {
        let databases = create_test_databases();
        let runner = SqlScriptRunner::new(databases.clone());

        runner
            .execute(&script("1_a.sql", "CREATE TABLE a (id INTEGER); INSERT INTO a VALUES (1);"))
            .await
            .unwrap();
        runner
            .execute(&script("@users_1_b.sql", "CREATE TABLE b (id INTEGER);"))
            .await
            .unwrap();

        let main = databases.get("main").unwrap();
        let users = databases.get("users").unwrap();
        assert_eq!(
            main.sql_handler().query_i64("SELECT COUNT(*) FROM a").await.unwrap(),
            Some(1)
        );
        assert!(users.sql_handler().query_rows("SELECT * FROM b").await.is_ok());
        assert!(main.sql_handler().query_rows("SELECT * FROM b").await.is_err());
    }

    #[tokio::test]
    async fn test_failure_names_script() {
        let runner = SqlScriptRunner::new(create_test_databases());
        let err = runner
            .execute(&script("2_broken.sql", "CREATE TABLE (;"))
            .await
            .unwrap_err();
        assert!(matches!(err, MaintainError::ScriptExecution { ref file_name, .. } if file_name == "2_broken.sql"));
    }

    #[tokio::test]
    async fn test_unknown_target_database() {
        let runner = SqlScriptRunner::new(create_test_databases());
        let err = runner
            .execute(&script("@reports_1_x.sql", "SELECT 1;"))
            .await
            .unwrap_err();
        assert!(matches!(err, MaintainError::UnknownTargetDatabase { .. }));
    }
}
