//! Database capabilities.
//!
//! Each supported dialect implements [`Database`], which describes the
//! objects a database holds and how to drop them, and owns a [`SqlHandler`]
//! that executes statements over a single connection. Dialects are selected
//! through the [`Dialect`] registry when the [`Databases`] are connected.
//!
//! Capabilities a dialect lacks are reported by [`Database::supports`];
//! callers check it and skip the category instead of calling into it.

mod sqlite;

pub use sqlite::{SqliteDatabase, SqliteSqlHandler};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::{MaintainError, Result};
use crate::script::Script;

/// Kinds of database objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DbItemType {
    /// Table.
    Table,
    /// View.
    View,
    /// Materialized view.
    MaterializedView,
    /// Synonym.
    Synonym,
    /// Sequence.
    Sequence,
    /// Trigger.
    Trigger,
    /// User-defined type.
    Type,
}

impl DbItemType {
    /// Order in which objects are dropped when clearing a schema. Objects
    /// that depend on others come first.
    pub const DROP_ORDER: [Self; 7] = [
        Self::Trigger,
        Self::Synonym,
        Self::View,
        Self::MaterializedView,
        Self::Table,
        Self::Sequence,
        Self::Type,
    ];
}

impl fmt::Display for DbItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Table => "Table",
            Self::View => "View",
            Self::MaterializedView => "Materialized view",
            Self::Synonym => "Synonym",
            Self::Sequence => "Sequence",
            Self::Trigger => "Trigger",
            Self::Type => "Type",
        })
    }
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// SQLite.
    Sqlite,
}

impl Dialect {
    /// Returns the dialect name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
        }
    }

    /// Creates the database implementation for this dialect. The
    /// connection is opened on first use.
    pub fn create(self, config: &DatabaseConfig) -> Result<Arc<dyn Database>> {
        match self {
            Self::Sqlite => Ok(Arc::new(SqliteDatabase::new(config)?)),
        }
    }
}

impl FromStr for Dialect {
    type Err = MaintainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            other => Err(MaintainError::UnknownDialect(other.to_string())),
        }
    }
}

/// How a database stores unquoted identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierCase {
    /// Unquoted identifiers are stored in upper case.
    Upper,
    /// Unquoted identifiers are stored in lower case.
    Lower,
    /// Identifiers are stored as written.
    Mixed,
    /// Identifiers are stored as written but compared case-insensitively.
    Insensitive,
}

impl IdentifierCase {
    /// Normalizes an identifier written by a user, e.g. in a preserve list.
    /// Quoted identifiers keep their case unless the database ignores case.
    #[must_use]
    pub fn normalize_configured(self, identifier: &str, quote: char) -> String {
        let trimmed = identifier.trim();
        let quoted = trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote);
        if quoted {
            let inner = &trimmed[quote.len_utf8()..trimmed.len() - quote.len_utf8()];
            return self.normalize_stored(inner);
        }
        match self {
            Self::Upper => trimmed.to_uppercase(),
            Self::Lower | Self::Insensitive => trimmed.to_lowercase(),
            Self::Mixed => trimmed.to_string(),
        }
    }

    /// Normalizes an identifier as returned by the database.
    #[must_use]
    pub fn normalize_stored(self, identifier: &str) -> String {
        match self {
            Self::Insensitive => identifier.to_lowercase(),
            Self::Upper | Self::Lower | Self::Mixed => identifier.to_string(),
        }
    }
}

/// A normalized reference to a database object, or to a schema when the
/// name is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DbItemIdentifier {
    database: String,
    schema: String,
    name: String,
}

impl DbItemIdentifier {
    /// Identifies an object by its stored schema and name.
    #[must_use]
    pub fn stored(database: &dyn Database, schema: &str, name: &str) -> Self {
        let case = database.identifier_case();
        Self {
            database: database.name().to_string(),
            schema: case.normalize_stored(schema),
            name: case.normalize_stored(name),
        }
    }

    /// Identifies a schema by its stored name.
    #[must_use]
    pub fn stored_schema(database: &dyn Database, schema: &str) -> Self {
        Self::stored(database, schema, "")
    }

    /// Parses `name`, `schema.name` or `database:schema.name`.
    pub fn parse_item(item: &str, databases: &Databases) -> Result<Self> {
        let (database, rest) = split_database(item, databases)?;
        let (schema, name) = match rest.split_once('.') {
            Some((schema, name)) => (schema, name),
            None => (database.default_schema(), rest),
        };
        if name.trim().is_empty() {
            return Err(MaintainError::config(format!("invalid item name '{}'", item)));
        }
        let case = database.identifier_case();
        let quote = database.identifier_quote();
        Ok(Self {
            database: database.name().to_string(),
            schema: case.normalize_configured(schema, quote),
            name: case.normalize_configured(name, quote),
        })
    }

    /// Parses `schema` or `database:schema`.
    pub fn parse_schema(item: &str, databases: &Databases) -> Result<Self> {
        let (database, schema) = split_database(item, databases)?;
        if schema.trim().is_empty() {
            return Err(MaintainError::config(format!("invalid schema name '{}'", item)));
        }
        let case = database.identifier_case();
        Ok(Self {
            database: database.name().to_string(),
            schema: case.normalize_configured(schema, database.identifier_quote()),
            name: String::new(),
        })
    }

    /// Returns the database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the normalized schema name.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Returns the normalized object name, empty for a schema.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn split_database<'a>(item: &'a str, databases: &'a Databases) -> Result<(&'a dyn Database, &'a str)> {
    match item.split_once(':') {
        Some((name, rest)) => {
            let database = databases.get(name.trim()).ok_or_else(|| {
                MaintainError::config(format!("unknown database '{}' in '{}'", name, item))
            })?;
            Ok((database.as_ref(), rest.trim()))
        }
        None => Ok((databases.default_database().as_ref(), item.trim())),
    }
}

/// A value read from a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Real(f64),
    /// Text value.
    Text(String),
}

impl SqlValue {
    /// Returns the value as text, converting numbers.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Integer(value) => Some(value.to_string()),
            Self::Real(value) => Some(value.to_string()),
            Self::Text(value) => Some(value.clone()),
        }
    }

    /// Returns the value as an integer, parsing text.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Null => None,
            Self::Integer(value) => Some(*value),
            #[allow(clippy::cast_possible_truncation)]
            Self::Real(value) => Some(*value as i64),
            Self::Text(value) => value.trim().parse().ok(),
        }
    }
}

/// Executes statements against one database over one connection.
///
/// The connection is opened on first use and released by [`close`].
///
/// [`close`]: SqlHandler::close
#[async_trait]
pub trait SqlHandler: Send + Sync {
    /// Executes a single statement with `?` placeholders bound to `params`,
    /// returning the number of affected rows.
    async fn execute_with(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Executes a script that may contain several statements.
    async fn execute_script(&self, sql: &str) -> Result<()>;

    /// Runs a query with `?` placeholders bound to `params` and returns all
    /// rows.
    async fn query_rows_with(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>>;

    /// Executes a single statement, returning the number of affected rows.
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.execute_with(sql, &[]).await
    }

    /// Runs a query and returns all rows.
    async fn query_rows(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>> {
        self.query_rows_with(sql, &[]).await
    }

    /// Runs a query and returns the first column of every row as text.
    async fn query_strings(&self, sql: &str) -> Result<Vec<String>> {
        Ok(self
            .query_rows(sql)
            .await?
            .into_iter()
            .filter_map(|row| row.first().and_then(SqlValue::as_text))
            .collect())
    }

    /// Runs a query and returns the first column of the first row as an
    /// integer.
    async fn query_i64(&self, sql: &str) -> Result<Option<i64>> {
        Ok(self
            .query_rows(sql)
            .await?
            .first()
            .and_then(|row| row.first())
            .and_then(SqlValue::as_i64))
    }

    /// Returns whether the query yields at least one row.
    async fn exists(&self, sql: &str) -> Result<bool> {
        Ok(!self.query_rows(sql).await?.is_empty())
    }

    /// Starts a transaction.
    async fn begin(&self) -> Result<()> {
        self.execute("BEGIN").await.map(|_| ())
    }

    /// Commits the current transaction.
    async fn commit(&self) -> Result<()> {
        self.execute("COMMIT").await.map(|_| ())
    }

    /// Rolls back the current transaction.
    async fn rollback(&self) -> Result<()> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    /// Closes the connection if it was opened.
    async fn close(&self) -> Result<()>;
}

/// Description and manipulation of the objects of one database.
#[async_trait]
pub trait Database: Send + Sync {
    /// Returns the logical name of the database.
    fn name(&self) -> &str;

    /// Returns the dialect.
    fn dialect(&self) -> Dialect;

    /// Returns the statement handler.
    fn sql_handler(&self) -> &dyn SqlHandler;

    /// Returns the managed schemas. Never empty; the first one is the
    /// default schema.
    fn schema_names(&self) -> &[String];

    /// Returns the default schema.
    fn default_schema(&self) -> &str {
        self.schema_names().first().map_or("", String::as_str)
    }

    /// Returns how identifiers are stored.
    fn identifier_case(&self) -> IdentifierCase;

    /// Returns the identifier quote character.
    fn identifier_quote(&self) -> char {
        '"'
    }

    /// Returns whether the dialect knows objects of this kind.
    fn supports(&self, item_type: DbItemType) -> bool;

    /// Returns whether the dialect has identity (auto-increment) columns
    /// whose next value can be changed.
    fn supports_identity_columns(&self) -> bool {
        false
    }

    /// Quotes an identifier.
    fn quote(&self, identifier: &str) -> String {
        let quote = self.identifier_quote();
        let escaped = identifier.replace(quote, &format!("{}{}", quote, quote));
        format!("{}{}{}", quote, escaped, quote)
    }

    /// Returns the quoted, schema-qualified name of an object.
    fn qualified(&self, schema: &str, name: &str) -> String {
        format!("{}.{}", self.quote(schema), self.quote(name))
    }

    /// Returns whether the schema exists.
    async fn schema_exists(&self, schema: &str) -> Result<bool>;

    /// Returns the names of the objects of a kind in a schema.
    async fn item_names(&self, schema: &str, item_type: DbItemType) -> Result<BTreeSet<String>>;

    /// Drops an object.
    async fn drop_item(&self, schema: &str, item_type: DbItemType, name: &str) -> Result<()>;

    /// Returns, per table, the tables it references through foreign keys,
    /// or `None` when the dialect can't tell.
    async fn table_dependencies(
        &self,
        _schema: &str,
    ) -> Result<Option<HashMap<String, BTreeSet<String>>>> {
        Ok(None)
    }

    /// Disables foreign key constraints.
    async fn disable_referential_constraints(&self, schema: &str) -> Result<()>;

    /// Disables not-null and check constraints.
    async fn disable_value_constraints(&self, schema: &str) -> Result<()>;

    /// Returns the current value of every sequence in a schema.
    async fn sequence_values(&self, _schema: &str) -> Result<Vec<(String, i64)>> {
        Ok(Vec::new())
    }

    /// Sets the next value of a sequence.
    async fn set_sequence_value(&self, schema: &str, name: &str, _value: i64) -> Result<()> {
        Err(MaintainError::config(format!(
            "{} does not support sequences ({}.{})",
            self.dialect().name(),
            schema,
            name
        )))
    }

    /// Returns the current identity value of every table with an identity
    /// column in a schema.
    async fn identity_values(&self, _schema: &str) -> Result<Vec<(String, i64)>> {
        Ok(Vec::new())
    }

    /// Sets the identity value of a table.
    async fn set_identity_value(&self, schema: &str, table: &str, _value: i64) -> Result<()> {
        Err(MaintainError::config(format!(
            "{} does not support identity columns ({}.{})",
            self.dialect().name(),
            schema,
            table
        )))
    }

    /// Deletes all rows of a table.
    async fn delete_all_rows(&self, schema: &str, table: &str) -> Result<()> {
        let sql = format!("DELETE FROM {}", self.qualified(schema, table));
        self.sql_handler().execute(&sql).await.map(|_| ())
    }
}

/// The configured target databases. The first one is the default database.
#[derive(Clone)]
pub struct Databases {
    databases: Vec<Arc<dyn Database>>,
}

impl fmt::Debug for Databases {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.databases.iter().map(|db| db.name()))
            .finish()
    }
}

impl Databases {
    /// Wraps already created databases.
    pub fn new(databases: Vec<Arc<dyn Database>>) -> Result<Self> {
        if databases.is_empty() {
            return Err(MaintainError::NoDatabases);
        }
        let mut names = BTreeSet::new();
        for database in &databases {
            if !names.insert(database.name()) {
                return Err(MaintainError::config(format!(
                    "database '{}' is configured twice",
                    database.name()
                )));
            }
        }
        Ok(Self { databases })
    }

    /// Creates the databases of the configuration through the dialect
    /// registry.
    pub fn from_config(configs: &[DatabaseConfig]) -> Result<Self> {
        let databases = configs
            .iter()
            .map(|config| config.dialect.create(config))
            .collect::<Result<Vec<_>>>()?;
        Self::new(databases)
    }

    /// Returns the default database.
    #[must_use]
    pub fn default_database(&self) -> &Arc<dyn Database> {
        &self.databases[0]
    }

    /// Finds a database by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Database>> {
        self.databases.iter().find(|db| db.name() == name)
    }

    /// Returns the database a script runs against.
    pub fn target_of(&self, script: &Script) -> Result<&Arc<dyn Database>> {
        match script.target_database() {
            None => Ok(self.default_database()),
            Some(name) => self.get(name).ok_or_else(|| MaintainError::UnknownTargetDatabase {
                file_name: script.file_name().to_string(),
                database: name.to_string(),
            }),
        }
    }

    /// Iterates over all databases.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Database>> {
        self.databases.iter()
    }

    /// Closes every connection. Every database is closed even when one of
    /// them fails; the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for database in &self.databases {
            debug!(database = %database.name(), "Closing connection");
            if let Err(e) = database.sql_handler().close().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn databases() -> Databases {
        Databases::from_config(&[
            DatabaseConfig::sqlite_memory("main"),
            DatabaseConfig::sqlite_memory("users"),
        ])
        .unwrap()
    }

    #[test]
    fn test_dialect_registry() {
        assert_eq!("sqlite".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert_eq!("SQLite3".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert!(matches!(
            "oracle".parse::<Dialect>(),
            Err(MaintainError::UnknownDialect(_))
        ));
    }

    #[test]
    fn test_identifier_case() {
        assert_eq!(IdentifierCase::Upper.normalize_configured("users", '"'), "USERS");
        assert_eq!(IdentifierCase::Upper.normalize_configured("\"Users\"", '"'), "Users");
        assert_eq!(IdentifierCase::Lower.normalize_configured("Users", '"'), "users");
        assert_eq!(IdentifierCase::Mixed.normalize_configured("Users", '"'), "Users");
        assert_eq!(IdentifierCase::Insensitive.normalize_configured("\"Users\"", '"'), "users");
        assert_eq!(IdentifierCase::Upper.normalize_stored("Users"), "Users");
        assert_eq!(IdentifierCase::Insensitive.normalize_stored("Users"), "users");
    }

    #[test]
    fn test_parse_item() {
        let dbs = databases();
        let a = DbItemIdentifier::parse_item("Audit_Log", &dbs).unwrap();
        let b = DbItemIdentifier::parse_item("main.audit_log", &dbs).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.database(), "main");
        assert_eq!(a.schema(), "main");
        assert_eq!(a.name(), "audit_log");

        let c = DbItemIdentifier::parse_item("users:main.accounts", &dbs).unwrap();
        assert_eq!(c.database(), "users");
        assert_eq!(
            c,
            DbItemIdentifier::stored(dbs.get("users").unwrap().as_ref(), "main", "ACCOUNTS")
        );

        assert!(DbItemIdentifier::parse_item("nope:main.x", &dbs).is_err());
        assert!(DbItemIdentifier::parse_item("main.", &dbs).is_err());
    }

    #[test]
    fn test_parse_schema() {
        let dbs = databases();
        let schema = DbItemIdentifier::parse_schema("users:MAIN", &dbs).unwrap();
        assert_eq!(schema.database(), "users");
        assert_eq!(schema.schema(), "main");
        assert!(schema.name().is_empty());
    }

    #[test]
    fn test_duplicate_database_names() {
        let result = Databases::from_config(&[
            DatabaseConfig::sqlite_memory("main"),
            DatabaseConfig::sqlite_memory("main"),
        ]);
        assert!(matches!(result, Err(MaintainError::Config(_))));
    }

    #[test]
    fn test_sql_value_conversions() {
        assert_eq!(SqlValue::Integer(3).as_text().as_deref(), Some("3"));
        assert_eq!(SqlValue::Text(" 42 ".to_string()).as_i64(), Some(42));
        assert_eq!(SqlValue::Null.as_i64(), None);
    }
}
