//! Bringing a database up to date with its scripts.
//!
//! [`DbMaintainer`] compares the script repository with the ledger (see
//! [`ScriptUpdatesAnalyzer`]) and then either executes the new and changed
//! scripts, or, when the differences can't be applied incrementally and
//! from-scratch updates are enabled, clears the database and replays every
//! script.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::cleaner::DbCleaner;
use crate::clearer::DbClearer;
use crate::config::MaintainerConfig;
use crate::constraints::ConstraintsDisabler;
use crate::database::Databases;
use crate::error::{MaintainError, Result};
use crate::ledger::{ExecutedScript, ExecutedScriptInfoSource};
use crate::repository::{ScriptFilter, ScriptRepository};
use crate::runner::ScriptRunner;
use crate::script::Script;
use crate::sequences::SequenceUpdater;
use crate::updates::{ScriptUpdates, ScriptUpdatesAnalyzer};

/// Outcome of [`DbMaintainer::update_database`].
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    /// Scripts executed, in execution order.
    pub executed_scripts: Vec<String>,
    /// Ledger entries renamed, as `(from, to)`.
    pub renamed_scripts: Vec<(String, String)>,
    /// Ledger entries removed because their script was deleted.
    pub deleted_scripts: Vec<String>,
    /// Whether the database was cleared and rebuilt.
    pub recreated_from_scratch: bool,
}

impl UpdateReport {
    /// Returns whether the run changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executed_scripts.is_empty()
            && self.renamed_scripts.is_empty()
            && self.deleted_scripts.is_empty()
    }
}

/// Keeps a database in sync with a script repository.
pub struct DbMaintainer {
    config: MaintainerConfig,
    databases: Databases,
    repository: ScriptRepository,
    filter: ScriptFilter,
    ledger: Arc<dyn ExecutedScriptInfoSource>,
    runner: Arc<dyn ScriptRunner>,
}

impl DbMaintainer {
    /// Creates a maintainer from its collaborators.
    pub fn new(
        config: MaintainerConfig,
        databases: Databases,
        repository: ScriptRepository,
        ledger: Arc<dyn ExecutedScriptInfoSource>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Result<Self> {
        let filter = ScriptFilter::new(&config.scripts)?;
        Ok(Self {
            config,
            databases,
            repository,
            filter,
            ledger,
            runner,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &MaintainerConfig {
        &self.config
    }

    /// Returns the databases.
    #[must_use]
    pub fn databases(&self) -> &Databases {
        &self.databases
    }

    /// Returns the script repository.
    #[must_use]
    pub fn repository(&self) -> &ScriptRepository {
        &self.repository
    }

    /// Returns the executed scripts recorded in the ledger.
    pub async fn executed_scripts(&self) -> Result<Vec<ExecutedScript>> {
        self.ledger.executed_scripts().await
    }

    /// Brings the database up to date.
    ///
    /// New incremental scripts run in version order, then new and changed
    /// repeatable scripts, then every postprocessing script. A script
    /// failure stops the run and leaves a failed ledger entry that blocks
    /// later runs until the script changes or is marked as performed or
    /// reverted.
    ///
    /// Postprocessing scripts only run when at least one other script is
    /// executed. An update of a database that is already up to date runs
    /// nothing, not even the postprocessing scripts.
    pub async fn update_database(&self) -> Result<UpdateReport> {
        self.check_target_databases()?;
        let all_executed = self.ledger.executed_scripts().await?;
        let ledger_was_empty = all_executed.is_empty();
        let executed = self.accepted(all_executed);
        let mut updates = self.analyzer().analyze(&executed);

        let mut report = UpdateReport::default();
        if let Some(conflict) = updates.conflicts().first() {
            if !self.config.from_scratch_enabled {
                return Err(conflict.clone().into());
            }
            warn!(
                file_name = %conflict.file_name(),
                "Irregular script update, recreating the database from scratch"
            );
            self.clearer()?.clear_database().await?;
            self.ledger.clear_all().await?;
            updates = ScriptUpdates::from_scratch(&self.repository);
            report.recreated_from_scratch = true;
        } else if let Some(file_name) = updates.error_scripts().first() {
            return Err(MaintainError::ErrorScriptPending {
                file_name: file_name.clone(),
            });
        } else if ledger_was_empty
            && updates.has_scripts_to_execute()
            && self.config.from_scratch_enabled
            && !self.config.preserve.has_items_to_preserve()
        {
            info!("Initial update, clearing the database");
            self.clearer()?.clear_database().await?;
        }

        for rename in updates.renames() {
            if let Some(previous) = rename.previous_file_name() {
                self.ledger.rename(previous, rename.script()).await?;
                report
                    .renamed_scripts
                    .push((previous.to_string(), rename.script().file_name().to_string()));
            }
        }
        for deleted in updates.deleted_repeatable_scripts() {
            let file_name = deleted.script().file_name();
            info!(file_name = %file_name, "Removing deleted repeatable script");
            self.ledger.delete(file_name).await?;
            report.deleted_scripts.push(file_name.to_string());
        }

        if !updates.has_scripts_to_execute() {
            info!("Database is up to date");
            return Ok(report);
        }

        if self.config.clean_db {
            self.clean_database().await?;
        }

        for update in updates
            .incremental_updates()
            .iter()
            .chain(updates.repeatable_updates())
        {
            self.execute(update.script(), update.update_type().is_new())
                .await?;
            report
                .executed_scripts
                .push(update.script().file_name().to_string());
        }

        self.ledger.delete_all_post_processing().await?;
        for script in self.repository.post_processing_scripts() {
            self.execute(script, true).await?;
            report.executed_scripts.push(script.file_name().to_string());
        }

        if self.config.disable_constraints {
            self.disable_constraints().await?;
        }
        if self.config.update_sequences {
            self.update_sequences().await?;
        }

        info!(
            executed = report.executed_scripts.len(),
            from_scratch = report.recreated_from_scratch,
            "Database updated"
        );
        Ok(report)
    }

    /// Computes what [`update_database`](Self::update_database) would do
    /// without changing anything.
    ///
    /// Fails on conflicts when from-scratch updates are disabled, and on
    /// failed scripts that are still unchanged.
    pub async fn check_script_updates(&self) -> Result<ScriptUpdates> {
        self.check_target_databases()?;
        let executed = self.accepted(self.ledger.executed_scripts().await?);
        let updates = self.analyzer().analyze(&executed);

        if let Some(conflict) = updates.conflicts().first() {
            if !self.config.from_scratch_enabled {
                return Err(conflict.clone().into());
            }
        } else if let Some(file_name) = updates.error_scripts().first() {
            return Err(MaintainError::ErrorScriptPending {
                file_name: file_name.clone(),
            });
        }
        Ok(updates)
    }

    /// Records every script as successfully executed without executing
    /// anything. Use this when the database was brought up to date by other
    /// means.
    pub async fn mark_database_as_up_to_date(&self) -> Result<()> {
        self.check_target_databases()?;
        // Creates the ledger table outside the transaction if needed.
        self.ledger.executed_scripts().await?;

        let sql = self.databases.default_database().sql_handler();
        sql.begin().await?;
        let result = async {
            self.ledger.clear_all().await?;
            for script in self.repository.all_scripts() {
                self.ledger
                    .register(&ExecutedScript::new(script.clone(), Utc::now(), true))
                    .await?;
            }
            Ok::<_, MaintainError>(())
        }
        .await;

        match result {
            Ok(()) => {
                sql.commit().await?;
                info!(scripts = self.repository.len(), "Marked database as up to date");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_error) = sql.rollback().await {
                    warn!(error = %rollback_error, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Marks the failed scripts as successfully executed, after the
    /// database was fixed manually.
    pub async fn mark_error_script_performed(&self) -> Result<()> {
        self.ledger.mark_error_scripts_as_successful().await
    }

    /// Removes the failed scripts from the ledger, after their changes were
    /// reverted manually. They run again on the next update.
    pub async fn mark_error_script_reverted(&self) -> Result<()> {
        self.ledger.remove_error_scripts().await
    }

    /// Drops every database object that is not preserved and clears the
    /// ledger.
    pub async fn clear_database(&self) -> Result<()> {
        self.clearer()?.clear_database().await?;
        self.ledger.clear_all().await
    }

    /// Deletes the data of every table that is not preserved.
    pub async fn clean_database(&self) -> Result<()> {
        DbCleaner::new(
            self.databases.clone(),
            &self.config.preserve,
            &self.config.ledger.table_name,
        )?
        .clean_database()
        .await
    }

    /// Disables the constraints of every schema.
    pub async fn disable_constraints(&self) -> Result<()> {
        ConstraintsDisabler::new(self.databases.clone())
            .disable_constraints()
            .await
    }

    /// Raises sequences and identity columns to the lowest acceptable value.
    pub async fn update_sequences(&self) -> Result<()> {
        SequenceUpdater::new(
            self.databases.clone(),
            self.config.lowest_acceptable_sequence_value,
        )
        .update_sequences()
        .await
    }

    fn analyzer(&self) -> ScriptUpdatesAnalyzer<'_> {
        ScriptUpdatesAnalyzer::new(
            &self.repository,
            self.config.use_last_modification_dates,
            self.config.allow_out_of_sequence_patches,
        )
    }

    fn clearer(&self) -> Result<DbClearer> {
        DbClearer::new(
            self.databases.clone(),
            &self.config.preserve,
            &self.config.ledger.table_name,
        )
    }

    fn accepted(&self, executed: Vec<ExecutedScript>) -> Vec<ExecutedScript> {
        executed
            .into_iter()
            .filter(|e| self.filter.accepts(e.script()))
            .collect()
    }

    fn check_target_databases(&self) -> Result<()> {
        for script in self.repository.all_scripts() {
            self.databases.target_of(script)?;
        }
        Ok(())
    }

    async fn execute(&self, script: &Script, is_new: bool) -> Result<()> {
        let pending = ExecutedScript::new(script.clone(), Utc::now(), false);
        if is_new {
            self.ledger.register(&pending).await?;
        } else {
            self.ledger.update(&pending).await?;
        }

        if let Err(e) = self.runner.execute(script).await {
            error!(file_name = %script.file_name(), error = %e, "Script failed");
            return Err(e);
        }
        self.ledger
            .update(&ExecutedScript::new(script.clone(), Utc::now(), true))
            .await
    }
}
