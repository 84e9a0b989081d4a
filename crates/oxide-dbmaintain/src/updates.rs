//! Comparing the scripts with the executed scripts.
//!
//! [`ScriptUpdatesAnalyzer`] turns the repository and the ledger into
//! [`ScriptUpdates`]: the scripts to execute, the ledger entries to rename or
//! remove, the conflicts that need a from-scratch rebuild and the failed
//! scripts that block the run.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::error::ScriptConflict;
use crate::ledger::ExecutedScript;
use crate::repository::ScriptRepository;
use crate::script::Script;

/// Kind of a change between the repository and the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptUpdateType {
    /// Incremental script with a higher index than all executed ones.
    IndexedScriptAdded,
    /// Patch script with a lower index than the highest executed one.
    PatchScriptAdded,
    /// Executed patch script whose content changed.
    PatchScriptUpdated,
    /// Script that failed before and whose content changed since.
    FailedScriptUpdated,
    /// Repeatable script that was never executed.
    RepeatableScriptAdded,
    /// Repeatable script whose content changed.
    RepeatableScriptUpdated,
    /// Executed repeatable script that no longer exists.
    RepeatableScriptDeleted,
    /// Postprocessing script that was never executed.
    PostProcessingScriptAdded,
    /// Postprocessing script whose content changed.
    PostProcessingScriptUpdated,
    /// Executed postprocessing script that no longer exists.
    PostProcessingScriptDeleted,
    /// Executed script that was renamed without changing its content.
    ScriptRenamed,
}

impl ScriptUpdateType {
    /// Returns whether the script has no ledger entry yet.
    #[must_use]
    pub fn is_new(self) -> bool {
        matches!(
            self,
            Self::IndexedScriptAdded
                | Self::PatchScriptAdded
                | Self::RepeatableScriptAdded
                | Self::PostProcessingScriptAdded
        )
    }
}

impl fmt::Display for ScriptUpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IndexedScriptAdded => "incremental script added",
            Self::PatchScriptAdded => "patch script added",
            Self::PatchScriptUpdated => "patch script updated",
            Self::FailedScriptUpdated => "failed script updated",
            Self::RepeatableScriptAdded => "repeatable script added",
            Self::RepeatableScriptUpdated => "repeatable script updated",
            Self::RepeatableScriptDeleted => "repeatable script deleted",
            Self::PostProcessingScriptAdded => "postprocessing script added",
            Self::PostProcessingScriptUpdated => "postprocessing script updated",
            Self::PostProcessingScriptDeleted => "postprocessing script deleted",
            Self::ScriptRenamed => "script renamed",
        })
    }
}

/// One change between the repository and the ledger.
#[derive(Debug, Clone)]
pub struct ScriptUpdate {
    update_type: ScriptUpdateType,
    script: Script,
    previous_file_name: Option<String>,
}

impl ScriptUpdate {
    fn new(update_type: ScriptUpdateType, script: &Script) -> Self {
        Self {
            update_type,
            script: script.clone(),
            previous_file_name: None,
        }
    }

    fn renamed(script: &Script, previous_file_name: &str) -> Self {
        Self {
            update_type: ScriptUpdateType::ScriptRenamed,
            script: script.clone(),
            previous_file_name: Some(previous_file_name.to_string()),
        }
    }

    /// Returns the kind of change.
    #[must_use]
    pub fn update_type(&self) -> ScriptUpdateType {
        self.update_type
    }

    /// Returns the script. For deletions this is the executed snapshot.
    #[must_use]
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Returns the old file name of a renamed script.
    #[must_use]
    pub fn previous_file_name(&self) -> Option<&str> {
        self.previous_file_name.as_deref()
    }
}

impl fmt::Display for ScriptUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.previous_file_name {
            Some(previous) => write!(
                f,
                "{}: {} -> {}",
                self.update_type,
                previous,
                self.script.file_name()
            ),
            None => write!(f, "{}: {}", self.update_type, self.script.file_name()),
        }
    }
}

/// Everything that differs between the repository and the ledger.
#[derive(Debug, Clone, Default)]
pub struct ScriptUpdates {
    incremental: Vec<ScriptUpdate>,
    repeatable: Vec<ScriptUpdate>,
    deleted_repeatable: Vec<ScriptUpdate>,
    post_processing: Vec<ScriptUpdate>,
    renames: Vec<ScriptUpdate>,
    conflicts: Vec<ScriptConflict>,
    error_scripts: Vec<String>,
}

impl ScriptUpdates {
    /// Treats every script of the repository as new.
    #[must_use]
    pub fn from_scratch(repository: &ScriptRepository) -> Self {
        let all = |scripts: &BTreeSet<Script>, update_type: ScriptUpdateType| -> Vec<ScriptUpdate> {
            scripts
                .iter()
                .map(|script| ScriptUpdate::new(update_type, script))
                .collect()
        };
        Self {
            incremental: all(
                repository.indexed_scripts(),
                ScriptUpdateType::IndexedScriptAdded,
            ),
            repeatable: all(
                repository.repeatable_scripts(),
                ScriptUpdateType::RepeatableScriptAdded,
            ),
            post_processing: all(
                repository.post_processing_scripts(),
                ScriptUpdateType::PostProcessingScriptAdded,
            ),
            ..Self::default()
        }
    }

    /// Returns the incremental and patch scripts to execute, in order.
    #[must_use]
    pub fn incremental_updates(&self) -> &[ScriptUpdate] {
        &self.incremental
    }

    /// Returns the repeatable scripts to execute, in order.
    #[must_use]
    pub fn repeatable_updates(&self) -> &[ScriptUpdate] {
        &self.repeatable
    }

    /// Returns the executed repeatable scripts that no longer exist.
    #[must_use]
    pub fn deleted_repeatable_scripts(&self) -> &[ScriptUpdate] {
        &self.deleted_repeatable
    }

    /// Returns the postprocessing scripts that were added, changed or
    /// deleted.
    #[must_use]
    pub fn post_processing_updates(&self) -> &[ScriptUpdate] {
        &self.post_processing
    }

    /// Returns the renamed scripts.
    #[must_use]
    pub fn renames(&self) -> &[ScriptUpdate] {
        &self.renames
    }

    /// Returns the conflicts that need a from-scratch rebuild.
    #[must_use]
    pub fn conflicts(&self) -> &[ScriptConflict] {
        &self.conflicts
    }

    /// Returns the failed scripts that are still unchanged.
    #[must_use]
    pub fn error_scripts(&self) -> &[String] {
        &self.error_scripts
    }

    /// Returns whether scripts must be executed. Postprocessing scripts are
    /// then executed as well.
    #[must_use]
    pub fn has_scripts_to_execute(&self) -> bool {
        !self.incremental.is_empty() || !self.repeatable.is_empty() || !self.post_processing.is_empty()
    }

    /// Returns whether nothing differs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_scripts_to_execute()
            && self.deleted_repeatable.is_empty()
            && self.renames.is_empty()
            && self.conflicts.is_empty()
            && self.error_scripts.is_empty()
    }

    /// Iterates over every change, conflicts excluded.
    pub fn iter(&self) -> impl Iterator<Item = &ScriptUpdate> {
        self.renames
            .iter()
            .chain(&self.incremental)
            .chain(&self.repeatable)
            .chain(&self.deleted_repeatable)
            .chain(&self.post_processing)
    }
}

/// Compares a repository with the executed scripts.
#[derive(Debug)]
pub struct ScriptUpdatesAnalyzer<'a> {
    repository: &'a ScriptRepository,
    use_last_modification_dates: bool,
    allow_out_of_sequence_patches: bool,
}

#[derive(PartialEq, Eq)]
enum Kind {
    Incremental,
    Repeatable,
    PostProcessing,
}

fn kind(script: &Script) -> Kind {
    if script.is_post_processing() {
        Kind::PostProcessing
    } else if script.is_incremental() {
        Kind::Incremental
    } else {
        Kind::Repeatable
    }
}

impl<'a> ScriptUpdatesAnalyzer<'a> {
    /// Creates an analyzer.
    #[must_use]
    pub fn new(
        repository: &'a ScriptRepository,
        use_last_modification_dates: bool,
        allow_out_of_sequence_patches: bool,
    ) -> Self {
        Self {
            repository,
            use_last_modification_dates,
            allow_out_of_sequence_patches,
        }
    }

    /// Computes the updates. `executed` must be in script order.
    #[must_use]
    pub fn analyze(&self, executed: &[ExecutedScript]) -> ScriptUpdates {
        let mut updates = ScriptUpdates::default();
        let executed = self.detect_renames(executed, &mut updates);
        let by_name: HashMap<&str, &ExecutedScript> =
            executed.iter().map(|e| (e.file_name(), e)).collect();

        self.analyze_incremental(&executed, &by_name, &mut updates);
        self.analyze_repeatable(&executed, &by_name, &mut updates);
        self.analyze_post_processing(&executed, &by_name, &mut updates);

        debug!(
            incremental = updates.incremental.len(),
            repeatable = updates.repeatable.len(),
            post_processing = updates.post_processing.len(),
            renames = updates.renames.len(),
            conflicts = updates.conflicts.len(),
            "Analyzed script updates"
        );
        updates
    }

    /// Pairs executed scripts that disappeared with unexecuted scripts of
    /// the same kind and content. Returns the executed scripts as they are
    /// after the renames.
    fn detect_renames(
        &self,
        executed: &[ExecutedScript],
        updates: &mut ScriptUpdates,
    ) -> Vec<ExecutedScript> {
        let executed_names: HashSet<&str> = executed.iter().map(ExecutedScript::file_name).collect();
        let mut unexecuted: Vec<&Script> = self
            .repository
            .all_scripts()
            .filter(|s| !executed_names.contains(s.file_name()))
            .collect();
        let executed_incremental: Vec<&ExecutedScript> = executed
            .iter()
            .filter(|e| e.script().is_incremental())
            .collect();

        let mut result = Vec::with_capacity(executed.len());
        for e in executed {
            if self.repository.get(e.file_name()).is_some() {
                result.push(e.clone());
                continue;
            }
            let candidate = unexecuted.iter().position(|r| {
                kind(r) == kind(e.script())
                    && r.checksum() == e.script().checksum()
                    && (kind(r) != Kind::Incremental
                        || keeps_position(&executed_incremental, e, r))
            });
            match candidate {
                Some(index) => {
                    let renamed = unexecuted.remove(index);
                    updates.renames.push(ScriptUpdate::renamed(renamed, e.file_name()));
                    result.push(ExecutedScript::new(
                        renamed.clone(),
                        e.executed_at(),
                        e.succeeded(),
                    ));
                }
                None => result.push(e.clone()),
            }
        }
        result.sort();
        result
    }

    fn analyze_incremental(
        &self,
        executed: &[ExecutedScript],
        by_name: &HashMap<&str, &ExecutedScript>,
        updates: &mut ScriptUpdates,
    ) {
        let highest = executed
            .iter()
            .filter(|e| e.script().is_incremental())
            .filter_map(|e| e.script().version())
            .max();

        for e in executed.iter().filter(|e| e.script().is_incremental()) {
            let Some(script) = self.repository.get(e.file_name()) else {
                updates.conflicts.push(ScriptConflict::IndexedScriptDeleted {
                    file_name: e.file_name().to_string(),
                });
                continue;
            };
            if !e.succeeded() {
                if script.checksum() == e.script().checksum() {
                    updates.error_scripts.push(e.file_name().to_string());
                } else {
                    updates
                        .incremental
                        .push(ScriptUpdate::new(ScriptUpdateType::FailedScriptUpdated, script));
                }
            } else if !script.is_content_equal(e.script(), self.use_last_modification_dates) {
                if script.is_patch() && self.allow_out_of_sequence_patches {
                    updates
                        .incremental
                        .push(ScriptUpdate::new(ScriptUpdateType::PatchScriptUpdated, script));
                } else {
                    updates.conflicts.push(ScriptConflict::IndexedScriptModified {
                        file_name: e.file_name().to_string(),
                    });
                }
            }
        }

        for script in self.repository.indexed_scripts() {
            if by_name.contains_key(script.file_name()) {
                continue;
            }
            let out_of_sequence = match (highest, script.version()) {
                (Some(highest), Some(version)) => version <= highest,
                _ => false,
            };
            if !out_of_sequence {
                updates
                    .incremental
                    .push(ScriptUpdate::new(ScriptUpdateType::IndexedScriptAdded, script));
                continue;
            }
            let highest_executed = highest.cloned().unwrap_or_default();
            if !script.is_patch() {
                updates.conflicts.push(ScriptConflict::ScriptAddedOutOfSequence {
                    file_name: script.file_name().to_string(),
                    highest_executed,
                });
            } else if self.allow_out_of_sequence_patches {
                updates
                    .incremental
                    .push(ScriptUpdate::new(ScriptUpdateType::PatchScriptAdded, script));
            } else {
                updates.conflicts.push(ScriptConflict::PatchAddedOutOfSequence {
                    file_name: script.file_name().to_string(),
                    highest_executed,
                });
            }
        }

        updates.incremental.sort_by(|a, b| a.script.cmp(&b.script));
    }

    fn analyze_repeatable(
        &self,
        executed: &[ExecutedScript],
        by_name: &HashMap<&str, &ExecutedScript>,
        updates: &mut ScriptUpdates,
    ) {
        for script in self.repository.repeatable_scripts() {
            match self.changed(script, by_name, &mut updates.error_scripts) {
                Change::None => {}
                Change::Added => updates
                    .repeatable
                    .push(ScriptUpdate::new(ScriptUpdateType::RepeatableScriptAdded, script)),
                Change::Updated => updates
                    .repeatable
                    .push(ScriptUpdate::new(ScriptUpdateType::RepeatableScriptUpdated, script)),
            }
        }
        for e in executed.iter().filter(|e| e.script().is_repeatable()) {
            if self.repository.get(e.file_name()).is_none() {
                updates.deleted_repeatable.push(ScriptUpdate::new(
                    ScriptUpdateType::RepeatableScriptDeleted,
                    e.script(),
                ));
            }
        }
    }

    fn analyze_post_processing(
        &self,
        executed: &[ExecutedScript],
        by_name: &HashMap<&str, &ExecutedScript>,
        updates: &mut ScriptUpdates,
    ) {
        for script in self.repository.post_processing_scripts() {
            match self.changed(script, by_name, &mut updates.error_scripts) {
                Change::None => {}
                Change::Added => updates.post_processing.push(ScriptUpdate::new(
                    ScriptUpdateType::PostProcessingScriptAdded,
                    script,
                )),
                Change::Updated => updates.post_processing.push(ScriptUpdate::new(
                    ScriptUpdateType::PostProcessingScriptUpdated,
                    script,
                )),
            }
        }
        for e in executed.iter().filter(|e| e.script().is_post_processing()) {
            if self.repository.get(e.file_name()).is_none() {
                updates.post_processing.push(ScriptUpdate::new(
                    ScriptUpdateType::PostProcessingScriptDeleted,
                    e.script(),
                ));
            }
        }
    }

    /// Compares a repeatable or postprocessing script with its ledger entry.
    /// Checksums are compared even when the modification dates match.
    fn changed(
        &self,
        script: &Script,
        by_name: &HashMap<&str, &ExecutedScript>,
        error_scripts: &mut Vec<String>,
    ) -> Change {
        let Some(e) = by_name.get(script.file_name()) else {
            return Change::Added;
        };
        let same_content = script.checksum() == e.script().checksum();
        match (e.succeeded(), same_content) {
            (true, true) => Change::None,
            (false, true) => {
                error_scripts.push(script.file_name().to_string());
                Change::None
            }
            (_, false) => Change::Updated,
        }
    }
}

enum Change {
    None,
    Added,
    Updated,
}

/// Returns whether `renamed` can take the place of `executed` without
/// changing its position among the executed incremental scripts.
fn keeps_position(
    executed_incremental: &[&ExecutedScript],
    executed: &ExecutedScript,
    renamed: &Script,
) -> bool {
    let Some(version) = renamed.version() else {
        return false;
    };
    let Some(position) = executed_incremental
        .iter()
        .position(|e| e.file_name() == executed.file_name())
    else {
        return false;
    };
    let after_previous = position == 0
        || executed_incremental[position - 1]
            .script()
            .version()
            .map_or(true, |previous| previous < version);
    let before_next = executed_incremental
        .get(position + 1)
        .and_then(|next| next.script().version())
        .map_or(true, |next| version < next);
    after_previous && before_next
}
