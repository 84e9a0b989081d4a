//! Preserve lists.

use std::collections::{HashMap, HashSet};

use crate::database::{Database, DbItemIdentifier, DbItemType, Databases};
use crate::error::{MaintainError, Result};

/// Normalized set of schemas and objects that must be left alone.
#[derive(Debug, Default)]
pub struct PreservedItems {
    schemas: HashSet<DbItemIdentifier>,
    items: HashMap<DbItemType, HashSet<DbItemIdentifier>>,
    unchecked_tables: HashSet<DbItemIdentifier>,
}

impl PreservedItems {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds configured schema names.
    pub fn add_schemas(&mut self, names: &[String], databases: &Databases) -> Result<()> {
        for name in names {
            self.schemas
                .insert(DbItemIdentifier::parse_schema(name, databases)?);
        }
        Ok(())
    }

    /// Adds configured object names of one kind.
    pub fn add_items(
        &mut self,
        item_type: DbItemType,
        names: &[String],
        databases: &Databases,
    ) -> Result<()> {
        let set = self.items.entry(item_type).or_default();
        for name in names {
            set.insert(DbItemIdentifier::parse_item(name, databases)?);
        }
        Ok(())
    }

    /// Adds a table that may not exist yet, such as the executed scripts
    /// table. It is not checked by [`validate`](Self::validate).
    pub fn add_unchecked_table(&mut self, identifier: DbItemIdentifier) {
        self.unchecked_tables.insert(identifier);
    }

    /// Checks that every configured schema and object exists.
    pub async fn validate(&self, databases: &Databases) -> Result<()> {
        for schema in &self.schemas {
            let database = lookup(databases, schema)?;
            if !database.schema_exists(schema.schema()).await? {
                return Err(MaintainError::PreservedSchemaNotFound {
                    database: schema.database().to_string(),
                    schema: schema.schema().to_string(),
                });
            }
        }

        for (item_type, identifiers) in &self.items {
            for identifier in identifiers {
                let database = lookup(databases, identifier)?;
                let exists = database.supports(*item_type)
                    && database
                        .item_names(identifier.schema(), *item_type)
                        .await?
                        .iter()
                        .any(|name| {
                            DbItemIdentifier::stored(database, identifier.schema(), name)
                                == *identifier
                        });
                if !exists {
                    return Err(MaintainError::PreservedItemNotFound {
                        item_type: *item_type,
                        database: identifier.database().to_string(),
                        schema: identifier.schema().to_string(),
                        name: identifier.name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns whether a whole schema is preserved.
    #[must_use]
    pub fn is_schema_preserved(&self, database: &dyn Database, schema: &str) -> bool {
        self.schemas
            .contains(&DbItemIdentifier::stored_schema(database, schema))
    }

    /// Returns whether an object is preserved.
    #[must_use]
    pub fn is_item_preserved(
        &self,
        database: &dyn Database,
        schema: &str,
        item_type: DbItemType,
        name: &str,
    ) -> bool {
        let identifier = DbItemIdentifier::stored(database, schema, name);
        if item_type == DbItemType::Table && self.unchecked_tables.contains(&identifier) {
            return true;
        }
        self.items
            .get(&item_type)
            .is_some_and(|set| set.contains(&identifier))
    }
}

fn lookup<'a>(databases: &'a Databases, identifier: &DbItemIdentifier) -> Result<&'a dyn Database> {
    databases
        .get(identifier.database())
        .map(AsRef::as_ref)
        .ok_or_else(|| {
            MaintainError::config(format!("unknown database '{}'", identifier.database()))
        })
}
