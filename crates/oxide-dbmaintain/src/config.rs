//! Maintainer configuration.
//!
//! All prefixes, qualifiers and flags live in one [`MaintainerConfig`] value
//! that is loaded once (usually from a TOML file) and passed down to every
//! component.
//!
//! ```toml
//! from_scratch_enabled = true
//! allow_out_of_sequence_patches = true
//!
//! [[databases]]
//! name = "main"
//! dialect = "sqlite"
//! url = "sqlite:app.db"
//!
//! [scripts]
//! locations = ["dbscripts"]
//! qualifiers = ["demo"]
//!
//! [preserve]
//! tables = ["audit_log"]
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::database::Dialect;
use crate::error::{MaintainError, Result};
use crate::script::{Qualifier, ScriptIndexes};

/// Complete configuration of a maintenance run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintainerConfig {
    /// Target databases. The first one is the default database and holds
    /// the executed scripts table.
    pub databases: Vec<DatabaseConfig>,
    /// Script locations and naming conventions.
    pub scripts: ScriptConfig,
    /// Executed scripts table.
    pub ledger: LedgerConfig,
    /// Database objects that survive clearing and cleaning.
    pub preserve: PreserveConfig,
    /// Recreate the database from scratch when an irregular update is found.
    pub from_scratch_enabled: bool,
    /// Treat an incremental script as unchanged when its modification date
    /// equals the recorded one.
    pub use_last_modification_dates: bool,
    /// Allow patch scripts with a lower index than the highest executed one.
    pub allow_out_of_sequence_patches: bool,
    /// Delete all data from non-preserved tables before running updates.
    pub clean_db: bool,
    /// Disable constraints once all scripts have run.
    pub disable_constraints: bool,
    /// Raise sequences and identity columns once all scripts have run.
    pub update_sequences: bool,
    /// Value sequences and identity columns are raised to.
    pub lowest_acceptable_sequence_value: i64,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            scripts: ScriptConfig::default(),
            ledger: LedgerConfig::default(),
            preserve: PreserveConfig::default(),
            from_scratch_enabled: false,
            use_last_modification_dates: true,
            allow_out_of_sequence_patches: false,
            clean_db: false,
            disable_constraints: false,
            update_sequences: false,
            lowest_acceptable_sequence_value: 1000,
        }
    }
}

impl MaintainerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Adds a target database.
    #[must_use]
    pub fn database(mut self, database: DatabaseConfig) -> Self {
        self.databases.push(database);
        self
    }

    /// Adds a script location.
    #[must_use]
    pub fn script_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.scripts.locations.push(location.into());
        self
    }

    /// Registers a qualifier.
    #[must_use]
    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.scripts.qualifiers.push(qualifier.into());
        self
    }

    /// Enables or disables from-scratch updates.
    #[must_use]
    pub fn from_scratch_enabled(mut self, enabled: bool) -> Self {
        self.from_scratch_enabled = enabled;
        self
    }

    /// Enables or disables the modification date fast path.
    #[must_use]
    pub fn use_last_modification_dates(mut self, enabled: bool) -> Self {
        self.use_last_modification_dates = enabled;
        self
    }

    /// Allows or disallows out-of-sequence patches.
    #[must_use]
    pub fn allow_out_of_sequence_patches(mut self, allow: bool) -> Self {
        self.allow_out_of_sequence_patches = allow;
        self
    }

    /// Enables or disables cleaning the database before an update.
    #[must_use]
    pub fn clean_db(mut self, enabled: bool) -> Self {
        self.clean_db = enabled;
        self
    }

    /// Enables or disables disabling constraints after an update.
    #[must_use]
    pub fn disable_constraints(mut self, enabled: bool) -> Self {
        self.disable_constraints = enabled;
        self
    }

    /// Enables or disables updating sequences after an update.
    #[must_use]
    pub fn update_sequences(mut self, enabled: bool) -> Self {
        self.update_sequences = enabled;
        self
    }

    /// Sets the preserve lists.
    #[must_use]
    pub fn preserve(mut self, preserve: PreserveConfig) -> Self {
        self.preserve = preserve;
        self
    }

    /// Checks the configuration for errors that must stop a run before it
    /// touches the database.
    pub fn validate(&self) -> Result<()> {
        if self.databases.is_empty() {
            return Err(MaintainError::NoDatabases);
        }
        self.scripts.validate()
    }
}

/// A target database.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Logical name, referenced by `@name` tokens in script names.
    pub name: String,
    /// SQL dialect.
    pub dialect: Dialect,
    /// Connection URL.
    pub url: String,
    /// Schemas managed by the maintainer. The first one is the default.
    /// Empty means the dialect's default schema.
    pub schemas: Vec<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            dialect: Dialect::Sqlite,
            url: "sqlite::memory:".to_string(),
            schemas: Vec::new(),
        }
    }
}

impl DatabaseConfig {
    /// Creates a database configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, dialect: Dialect, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dialect,
            url: url.into(),
            schemas: Vec::new(),
        }
    }

    /// Creates an in-memory SQLite database configuration.
    #[must_use]
    pub fn sqlite_memory(name: impl Into<String>) -> Self {
        Self::new(name, Dialect::Sqlite, "sqlite::memory:")
    }
}

/// Script locations and naming conventions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Directories containing scripts.
    pub locations: Vec<PathBuf>,
    /// Extensions of script files, without the dot.
    pub extensions: Vec<String>,
    /// Prefix marking a qualifier token, e.g. `#` in `01_#patch_fix.sql`.
    pub qualifier_prefix: String,
    /// Prefix marking a target database token, e.g. `@` in `@users_01_x.sql`.
    pub target_database_prefix: String,
    /// Directory containing postprocessing scripts.
    pub postprocessing_dir: String,
    /// Registered qualifiers.
    pub qualifiers: Vec<String>,
    /// Qualifiers marking patch scripts.
    pub patch_qualifiers: Vec<String>,
    /// If not empty, qualified scripts are only kept when they carry one of
    /// these qualifiers.
    pub included_qualifiers: Vec<String>,
    /// Scripts carrying one of these qualifiers are ignored.
    pub excluded_qualifiers: Vec<String>,
    /// Incremental scripts with a lower index are ignored.
    pub baseline_revision: Option<String>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            locations: Vec::new(),
            extensions: vec!["sql".to_string(), "ddl".to_string()],
            qualifier_prefix: "#".to_string(),
            target_database_prefix: "@".to_string(),
            postprocessing_dir: "postprocessing".to_string(),
            qualifiers: Vec::new(),
            patch_qualifiers: vec!["patch".to_string()],
            included_qualifiers: Vec::new(),
            excluded_qualifiers: Vec::new(),
            baseline_revision: None,
        }
    }
}

impl ScriptConfig {
    /// Returns every registered qualifier, patch qualifiers included.
    pub fn registered_qualifiers(&self) -> Result<Vec<Qualifier>> {
        self.qualifiers
            .iter()
            .chain(&self.patch_qualifiers)
            .map(|name| Qualifier::new(name))
            .collect()
    }

    /// Returns the patch qualifiers.
    pub fn patch_qualifier_set(&self) -> Result<Vec<Qualifier>> {
        self.patch_qualifiers.iter().map(|name| Qualifier::new(name)).collect()
    }

    /// Parses the baseline revision.
    pub fn baseline(&self) -> Result<Option<ScriptIndexes>> {
        self.baseline_revision
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    /// Checks the script settings.
    pub fn validate(&self) -> Result<()> {
        if self.extensions.iter().all(|ext| ext.trim().is_empty()) {
            return Err(MaintainError::NoScriptExtensions);
        }
        if self.qualifier_prefix.is_empty() || self.target_database_prefix.is_empty() {
            return Err(MaintainError::config(
                "qualifier and target database prefixes must not be empty",
            ));
        }
        if self.qualifier_prefix == self.target_database_prefix {
            return Err(MaintainError::config(
                "qualifier and target database prefixes must differ",
            ));
        }
        let registered = self.registered_qualifiers()?;
        for (list, used_in) in [
            (&self.included_qualifiers, "included qualifiers"),
            (&self.excluded_qualifiers, "excluded qualifiers"),
        ] {
            for name in list {
                let qualifier = Qualifier::new(name)?;
                if !registered.contains(&qualifier) {
                    return Err(MaintainError::UnregisteredQualifier {
                        qualifier: qualifier.to_string(),
                        used_in: used_in.to_string(),
                    });
                }
            }
        }
        self.baseline()?;
        Ok(())
    }
}

/// Executed scripts table settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Table name.
    pub table_name: String,
    /// Column holding the script file name.
    pub file_name_column: String,
    /// Column holding the script modification date (millis since epoch).
    pub file_last_modified_at_column: String,
    /// Column holding the content checksum.
    pub checksum_column: String,
    /// Column holding the execution timestamp.
    pub executed_at_column: String,
    /// Column holding the success flag (0 or 1).
    pub succeeded_column: String,
    /// Create the table when it doesn't exist.
    pub auto_create: bool,
    /// `chrono` format of the execution timestamp. The default keeps the
    /// fractional seconds so a recorded timestamp reads back unchanged.
    pub timestamp_format: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            table_name: "dbmaintain_scripts".to_string(),
            file_name_column: "file_name".to_string(),
            file_last_modified_at_column: "file_last_modified_at".to_string(),
            checksum_column: "checksum".to_string(),
            executed_at_column: "executed_at".to_string(),
            succeeded_column: "succeeded".to_string(),
            auto_create: true,
            timestamp_format: "%Y-%m-%d %H:%M:%S%.f".to_string(),
        }
    }
}

/// Items that survive clearing and cleaning.
///
/// Entries are written as `name` (default schema of the default database),
/// `schema.name`, or `database:schema.name`. Schema entries are written as
/// `schema` or `database:schema`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PreserveConfig {
    /// Schemas left completely untouched.
    pub schemas: Vec<String>,
    /// Tables.
    pub tables: Vec<String>,
    /// Views.
    pub views: Vec<String>,
    /// Materialized views.
    pub materialized_views: Vec<String>,
    /// Synonyms.
    pub synonyms: Vec<String>,
    /// Sequences.
    pub sequences: Vec<String>,
    /// Triggers.
    pub triggers: Vec<String>,
    /// Types.
    pub types: Vec<String>,
    /// Schemas whose data survives cleaning.
    pub data_only_schemas: Vec<String>,
    /// Tables whose data survives cleaning.
    pub data_only_tables: Vec<String>,
}

impl PreserveConfig {
    /// Returns whether any item survives clearing.
    #[must_use]
    pub fn has_items_to_preserve(&self) -> bool {
        [
            &self.schemas,
            &self.tables,
            &self.views,
            &self.materialized_views,
            &self.synonyms,
            &self.sequences,
            &self.triggers,
            &self.types,
        ]
        .iter()
        .any(|list| !list.is_empty())
    }
}
