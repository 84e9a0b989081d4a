//! Script-based database maintenance.
//!
//! `oxide-dbmaintain` keeps a database in sync with a folder of SQL scripts:
//! - **Incremental** scripts (`01_create_users.sql`) run once, in index order
//! - **Repeatable** scripts (no index) run again whenever their content changes
//! - **Postprocessing** scripts (in `postprocessing/`) run after every update
//!
//! Every execution is recorded in a ledger table inside the database. When a
//! script changes in a way that can't be applied incrementally, the database
//! is either rejected or, with from-scratch updates enabled, cleared and
//! rebuilt from all scripts.
//!
//! # Architecture
//!
//! - **Script** - A script file and its parsed name (indexes, qualifiers, target database)
//! - **Repository** - The scripts found in the configured locations
//! - **Ledger** - The executed scripts table
//! - **Updates** - Diffs the repository against the ledger
//! - **Maintainer** - Applies the diff, or rebuilds from scratch
//! - **Clearer / Cleaner** - Drops database objects or deletes their data
//! - **Database** - Dialect-aware access to a target database (SQLite)
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_dbmaintain::prelude::*;
//!
//! let config = MaintainerConfig::new()
//!     .database(DatabaseConfig::new("main", Dialect::Sqlite, "sqlite:app.db"))
//!     .script_location("dbscripts")
//!     .from_scratch_enabled(true);
//!
//! let maintain = DbMaintain::connect(config)?;
//! let report = maintain.update_database().await?;
//! println!("{} scripts executed", report.executed_scripts.len());
//! maintain.close().await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Bring the database up to date
//! oxide-dbmaintain --config dbmaintain.toml update
//!
//! # Show what an update would do
//! oxide-dbmaintain --config dbmaintain.toml check
//!
//! # Show the executed scripts
//! oxide-dbmaintain --config dbmaintain.toml status
//! ```

use std::sync::Arc;

pub mod cleaner;
pub mod clearer;
pub mod config;
pub mod constraints;
pub mod database;
pub mod error;
pub mod ledger;
pub mod maintainer;
pub mod multipass;
pub mod preserve;
pub mod repository;
pub mod runner;
pub mod script;
pub mod sequences;
pub mod updates;

use crate::config::MaintainerConfig;
use crate::database::Databases;
use crate::error::{MaintainError, Result};
use crate::ledger::{DbExecutedScriptInfoSource, ExecutedScript};
use crate::maintainer::{DbMaintainer, UpdateReport};
use crate::repository::ScriptRepository;
use crate::runner::SqlScriptRunner;
use crate::script::ScriptFactory;
use crate::updates::ScriptUpdates;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cleaner::DbCleaner;
    pub use crate::clearer::DbClearer;
    pub use crate::config::{
        DatabaseConfig, LedgerConfig, MaintainerConfig, PreserveConfig, ScriptConfig,
    };
    pub use crate::constraints::ConstraintsDisabler;
    pub use crate::database::{Database, Databases, DbItemType, Dialect, SqlHandler};
    pub use crate::error::{MaintainError, Result, ScriptConflict};
    pub use crate::ledger::{DbExecutedScriptInfoSource, ExecutedScript, ExecutedScriptInfoSource};
    pub use crate::maintainer::{DbMaintainer, UpdateReport};
    pub use crate::repository::{ScriptFilter, ScriptLocation, ScriptRepository};
    pub use crate::runner::{ScriptRunner, SqlScriptRunner};
    pub use crate::script::{Qualifier, Script, ScriptFactory, ScriptIndexes};
    pub use crate::sequences::SequenceUpdater;
    pub use crate::updates::{ScriptUpdate, ScriptUpdateType, ScriptUpdates};
    pub use crate::DbMaintain;
}

/// Entry point wiring a [`DbMaintainer`] from a configuration.
///
/// The scripts are loaded from the configured locations, the ledger lives in
/// the default (first) database and scripts run as SQL. Connections are
/// opened on first use.
pub struct DbMaintain {
    maintainer: DbMaintainer,
}

impl DbMaintain {
    /// Validates the configuration, loads the scripts and prepares the
    /// databases.
    pub fn connect(config: MaintainerConfig) -> Result<Self> {
        config.validate()?;
        let factory = ScriptFactory::new(&config.scripts)?;
        let repository = ScriptRepository::load(&config.scripts, &factory)?;
        Self::assemble(config, factory, repository)
    }

    /// Prepares the databases without scanning the script locations.
    ///
    /// The maintainer sees no scripts, so only the operations that work on
    /// the databases and the ledger alone are meaningful: clearing,
    /// cleaning, constraints, sequences, error script resolution and
    /// listing the executed scripts.
    pub fn connect_without_scripts(config: MaintainerConfig) -> Result<Self> {
        if config.databases.is_empty() {
            return Err(MaintainError::NoDatabases);
        }
        let factory = ScriptFactory::new(&config.scripts)?;
        Self::assemble(config, factory, ScriptRepository::default())
    }

    fn assemble(
        config: MaintainerConfig,
        factory: ScriptFactory,
        repository: ScriptRepository,
    ) -> Result<Self> {
        let databases = Databases::from_config(&config.databases)?;
        let ledger = DbExecutedScriptInfoSource::new(
            databases.default_database().clone(),
            config.ledger.clone(),
            factory,
        );
        let runner = SqlScriptRunner::new(databases.clone());
        let maintainer = DbMaintainer::new(
            config,
            databases,
            repository,
            Arc::new(ledger),
            Arc::new(runner),
        )?;
        Ok(Self { maintainer })
    }

    /// Returns the underlying maintainer.
    #[must_use]
    pub fn maintainer(&self) -> &DbMaintainer {
        &self.maintainer
    }

    /// See [`DbMaintainer::update_database`].
    pub async fn update_database(&self) -> Result<UpdateReport> {
        self.maintainer.update_database().await
    }

    /// See [`DbMaintainer::check_script_updates`].
    pub async fn check_script_updates(&self) -> Result<ScriptUpdates> {
        self.maintainer.check_script_updates().await
    }

    /// See [`DbMaintainer::mark_database_as_up_to_date`].
    pub async fn mark_database_as_up_to_date(&self) -> Result<()> {
        self.maintainer.mark_database_as_up_to_date().await
    }

    /// See [`DbMaintainer::clear_database`].
    pub async fn clear_database(&self) -> Result<()> {
        self.maintainer.clear_database().await
    }

    /// See [`DbMaintainer::clean_database`].
    pub async fn clean_database(&self) -> Result<()> {
        self.maintainer.clean_database().await
    }

    /// See [`DbMaintainer::disable_constraints`].
    pub async fn disable_constraints(&self) -> Result<()> {
        self.maintainer.disable_constraints().await
    }

    /// See [`DbMaintainer::update_sequences`].
    pub async fn update_sequences(&self) -> Result<()> {
        self.maintainer.update_sequences().await
    }

    /// See [`DbMaintainer::mark_error_script_performed`].
    pub async fn mark_error_script_performed(&self) -> Result<()> {
        self.maintainer.mark_error_script_performed().await
    }

    /// See [`DbMaintainer::mark_error_script_reverted`].
    pub async fn mark_error_script_reverted(&self) -> Result<()> {
        self.maintainer.mark_error_script_reverted().await
    }

    /// Returns the executed scripts recorded in the ledger.
    pub async fn executed_scripts(&self) -> Result<Vec<ExecutedScript>> {
        self.maintainer.executed_scripts().await
    }

    /// Closes every database connection.
    pub async fn close(&self) -> Result<()> {
        self.maintainer.databases().close().await
    }
}
