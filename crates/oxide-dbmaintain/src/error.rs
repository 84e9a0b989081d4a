//! Error types for database maintenance.

use std::fmt;
use std::path::PathBuf;

use crate::database::DbItemType;
use crate::script::ScriptIndexes;

/// Errors that can occur while maintaining a database.
#[derive(Debug, thiserror::Error)]
pub enum MaintainError {
    /// No script locations were configured.
    #[error("No script locations configured")]
    NoScriptLocations,

    /// No script file extensions were configured.
    #[error("No script file extensions configured")]
    NoScriptExtensions,

    /// No databases were configured.
    #[error("No databases configured")]
    NoDatabases,

    /// A script location does not exist.
    #[error("Script location not found: {0}")]
    LocationNotFound(PathBuf),

    /// The same script was found in two locations.
    #[error("Script '{file_name}' is present in both '{first_location}' and '{second_location}'")]
    DuplicateScript {
        /// File name of the script.
        file_name: String,
        /// Location where the script was found first.
        first_location: String,
        /// Location where the script was found again.
        second_location: String,
    },

    /// Two incremental scripts share the same index.
    #[error("Scripts '{first}' and '{second}' have the same index {index}")]
    DuplicateScriptIndex {
        /// First script.
        first: String,
        /// Second script.
        second: String,
        /// The shared index.
        index: ScriptIndexes,
    },

    /// A qualifier is used that was not registered.
    #[error("Qualifier '{qualifier}' is not registered (used in {used_in})")]
    UnregisteredQualifier {
        /// The qualifier.
        qualifier: String,
        /// Where the qualifier was used.
        used_in: String,
    },

    /// A qualifier token in a script name is malformed.
    #[error("Malformed qualifier '{token}' in script '{file_name}'")]
    MalformedQualifier {
        /// The offending token.
        token: String,
        /// File name of the script.
        file_name: String,
    },

    /// A script file name can't be parsed.
    #[error("Invalid script name '{file_name}': {reason}")]
    InvalidScriptName {
        /// File name of the script.
        file_name: String,
        /// Why the name was rejected.
        reason: String,
    },

    /// Script indexes can't be parsed.
    #[error("Invalid script indexes '{0}'")]
    InvalidScriptIndexes(String),

    /// A script targets a database that is not configured.
    #[error("Script '{file_name}' targets database '{database}' which is not configured")]
    UnknownTargetDatabase {
        /// File name of the script.
        file_name: String,
        /// Name of the target database.
        database: String,
    },

    /// An unknown dialect name was configured.
    #[error("Unknown database dialect '{0}'")]
    UnknownDialect(String),

    /// A schema to preserve does not exist.
    #[error("Schema '{schema}' to preserve does not exist in database '{database}'")]
    PreservedSchemaNotFound {
        /// Name of the database.
        database: String,
        /// Name of the schema.
        schema: String,
    },

    /// A database object to preserve does not exist.
    #[error("{item_type} '{schema}.{name}' to preserve does not exist in database '{database}'")]
    PreservedItemNotFound {
        /// Kind of the object.
        item_type: DbItemType,
        /// Name of the database.
        database: String,
        /// Schema of the object.
        schema: String,
        /// Name of the object.
        name: String,
    },

    /// The ledger table does not exist and may not be created.
    #[error(
        "Executed scripts table '{table}' doesn't exist yet or is invalid. \
         Enable auto-creation of the table or create it manually:\n{create_statement}"
    )]
    LedgerTableMissing {
        /// Expected table name.
        table: String,
        /// Statement that creates the table.
        create_statement: String,
    },

    /// A ledger row can't be interpreted.
    #[error("Invalid executed scripts row: {0}")]
    InvalidLedgerRow(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The repository and the ledger disagree in a way that needs a
    /// from-scratch rebuild.
    #[error("{0}")]
    Conflict(ScriptConflict),

    /// A script failed during a previous run and has not been fixed.
    #[error(
        "During a previous update, the execution of script '{file_name}' failed. \
         Fix the script, or fix the database manually and mark the script as \
         performed or reverted."
    )]
    ErrorScriptPending {
        /// File name of the failed script.
        file_name: String,
    },

    /// Executing a script failed.
    #[error("Error while executing script '{file_name}': {source}")]
    ScriptExecution {
        /// File name of the script.
        file_name: String,
        /// The underlying failure.
        #[source]
        source: Box<MaintainError>,
    },

    /// The content of a script can't be read.
    #[error("Content of script '{0}' is not available")]
    ContentUnavailable(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading scripts or configuration).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error walking a script directory.
    #[error("Error scanning scripts: {0}")]
    Walk(#[from] walkdir::Error),

    /// Failed to parse the configuration file.
    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl MaintainError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns whether this error was raised before anything was executed
    /// because of an invalid configuration or script set.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::NoScriptLocations
                | Self::NoScriptExtensions
                | Self::NoDatabases
                | Self::LocationNotFound(_)
                | Self::DuplicateScript { .. }
                | Self::DuplicateScriptIndex { .. }
                | Self::UnregisteredQualifier { .. }
                | Self::MalformedQualifier { .. }
                | Self::InvalidScriptName { .. }
                | Self::InvalidScriptIndexes(_)
                | Self::UnknownTargetDatabase { .. }
                | Self::UnknownDialect(_)
                | Self::PreservedSchemaNotFound { .. }
                | Self::PreservedItemNotFound { .. }
                | Self::LedgerTableMissing { .. }
                | Self::Config(_)
                | Self::Toml(_)
        )
    }
}

impl From<ScriptConflict> for MaintainError {
    fn from(conflict: ScriptConflict) -> Self {
        Self::Conflict(conflict)
    }
}

/// An irregular difference between the scripts and the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptConflict {
    /// An incremental script was changed after it was executed.
    IndexedScriptModified {
        /// File name of the script.
        file_name: String,
    },
    /// An executed incremental script no longer exists.
    IndexedScriptDeleted {
        /// File name of the script.
        file_name: String,
    },
    /// An incremental script was added with a lower index than the highest
    /// executed one.
    ScriptAddedOutOfSequence {
        /// File name of the script.
        file_name: String,
        /// Highest index executed so far.
        highest_executed: ScriptIndexes,
    },
    /// A patch script was added out of sequence while that is not allowed.
    PatchAddedOutOfSequence {
        /// File name of the script.
        file_name: String,
        /// Highest index executed so far.
        highest_executed: ScriptIndexes,
    },
}

impl ScriptConflict {
    /// Returns the file name of the script causing the conflict.
    #[must_use]
    pub fn file_name(&self) -> &str {
        match self {
            Self::IndexedScriptModified { file_name }
            | Self::IndexedScriptDeleted { file_name }
            | Self::ScriptAddedOutOfSequence { file_name, .. }
            | Self::PatchAddedOutOfSequence { file_name, .. } => file_name,
        }
    }
}

impl fmt::Display for ScriptConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexedScriptModified { file_name } => {
                write!(f, "Incremental script '{}' was modified after it was executed", file_name)?;
            }
            Self::IndexedScriptDeleted { file_name } => {
                write!(f, "Incremental script '{}' was deleted after it was executed", file_name)?;
            }
            Self::ScriptAddedOutOfSequence {
                file_name,
                highest_executed,
            } => {
                write!(
                    f,
                    "Incremental script '{}' was added with an index lower than the highest executed index {}",
                    file_name, highest_executed
                )?;
            }
            Self::PatchAddedOutOfSequence {
                file_name,
                highest_executed,
            } => {
                write!(
                    f,
                    "Patch script '{}' was added with an index lower than the highest executed index {} \
                     and out-of-sequence patches are not allowed",
                    file_name, highest_executed
                )?;
            }
        }
        write!(
            f,
            ". Enable from-scratch updates to recreate the database, or revert the change."
        )
    }
}

/// Result type for maintenance operations.
pub type Result<T> = std::result::Result<T, MaintainError>;
