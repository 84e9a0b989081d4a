//! Script repository.
//!
//! The repository merges the scripts of one or more locations into a single
//! view, drops the scripts that are filtered out by the baseline revision or
//! the qualifier lists, and classifies the rest as indexed, repeatable or
//! postprocessing scripts.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::config::ScriptConfig;
use crate::error::{MaintainError, Result};
use crate::script::{Qualifier, Script, ScriptFactory, ScriptIndexes};

/// The scripts found in one location.
#[derive(Debug, Clone)]
pub struct ScriptLocation {
    name: String,
    scripts: BTreeSet<Script>,
}

impl ScriptLocation {
    /// Creates a location from scripts that were already loaded.
    pub fn from_scripts(name: impl Into<String>, scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            name: name.into(),
            scripts: scripts.into_iter().collect(),
        }
    }

    /// Scans a directory recursively for files with a script extension.
    pub fn from_directory(path: &Path, factory: &ScriptFactory) -> Result<Self> {
        if !path.is_dir() {
            return Err(MaintainError::LocationNotFound(path.to_path_buf()));
        }

        let mut scripts = BTreeSet::new();
        for entry in WalkDir::new(path).follow_links(true) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(path)
                .unwrap_or_else(|_| entry.path());
            let file_name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !factory.has_script_extension(&file_name) {
                debug!(file_name = %file_name, "Ignoring file without script extension");
                continue;
            }
            scripts.insert(factory.create_from_file(&file_name, entry.path())?);
        }

        debug!(location = %path.display(), count = scripts.len(), "Scanned script location");
        Ok(Self {
            name: path.display().to_string(),
            scripts,
        })
    }

    /// Returns the location name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the scripts of this location.
    #[must_use]
    pub fn scripts(&self) -> &BTreeSet<Script> {
        &self.scripts
    }
}

/// Decides which scripts take part in a run.
#[derive(Debug, Clone, Default)]
pub struct ScriptFilter {
    baseline: Option<ScriptIndexes>,
    included: BTreeSet<Qualifier>,
    excluded: BTreeSet<Qualifier>,
    patch: BTreeSet<Qualifier>,
}

impl ScriptFilter {
    /// Creates a filter from the script configuration.
    pub fn new(config: &ScriptConfig) -> Result<Self> {
        let parse_all = |names: &[String]| -> Result<BTreeSet<Qualifier>> {
            names.iter().map(|name| Qualifier::new(name)).collect()
        };
        Ok(Self {
            baseline: config.baseline()?,
            included: parse_all(&config.included_qualifiers)?,
            excluded: parse_all(&config.excluded_qualifiers)?,
            patch: parse_all(&config.patch_qualifiers)?,
        })
    }

    /// Returns whether the script takes part in the run.
    ///
    /// Scripts below the baseline and scripts with an excluded qualifier are
    /// dropped. When included qualifiers are configured, a script carrying
    /// qualifiers other than patch qualifiers must carry an included one.
    #[must_use]
    pub fn accepts(&self, script: &Script) -> bool {
        if let (Some(baseline), Some(version)) = (&self.baseline, script.version()) {
            if !script.is_post_processing() && version.is_below(baseline) {
                return false;
            }
        }
        if script.qualifiers().iter().any(|q| self.excluded.contains(q)) {
            return false;
        }
        if self.included.is_empty() {
            return true;
        }
        let mut labels = script
            .qualifiers()
            .iter()
            .filter(|q| !self.patch.contains(*q))
            .peekable();
        labels.peek().is_none() || script.qualifiers().iter().any(|q| self.included.contains(q))
    }
}

/// Classified view over the scripts of all locations.
#[derive(Debug, Clone, Default)]
pub struct ScriptRepository {
    indexed: BTreeSet<Script>,
    repeatable: BTreeSet<Script>,
    post_processing: BTreeSet<Script>,
    by_name: HashMap<String, Script>,
}

impl ScriptRepository {
    /// Builds the repository from already scanned locations.
    pub fn new(locations: Vec<ScriptLocation>, filter: &ScriptFilter) -> Result<Self> {
        if locations.is_empty() {
            return Err(MaintainError::NoScriptLocations);
        }
        assert_no_duplicate_scripts(&locations)?;

        let mut repository = Self::default();
        for location in locations {
            for script in location.scripts {
                if !filter.accepts(&script) {
                    debug!(file_name = %script.file_name(), "Script filtered out");
                    continue;
                }
                repository
                    .by_name
                    .insert(script.file_name().to_string(), script.clone());
                if script.is_post_processing() {
                    repository.post_processing.insert(script);
                } else if script.version().is_some() {
                    repository.indexed.insert(script);
                } else {
                    repository.repeatable.insert(script);
                }
            }
        }

        assert_no_duplicate_script_indexes(&repository.indexed)?;
        Ok(repository)
    }

    /// Scans the configured locations and builds the repository.
    pub fn load(config: &ScriptConfig, factory: &ScriptFactory) -> Result<Self> {
        if config.locations.is_empty() {
            return Err(MaintainError::NoScriptLocations);
        }
        let locations = config
            .locations
            .iter()
            .map(|path| ScriptLocation::from_directory(path, factory))
            .collect::<Result<Vec<_>>>()?;
        Self::new(locations, &ScriptFilter::new(config)?)
    }

    /// Returns the incremental scripts, ordered by version.
    #[must_use]
    pub fn indexed_scripts(&self) -> &BTreeSet<Script> {
        &self.indexed
    }

    /// Returns the repeatable scripts, ordered by name.
    #[must_use]
    pub fn repeatable_scripts(&self) -> &BTreeSet<Script> {
        &self.repeatable
    }

    /// Returns the postprocessing scripts.
    #[must_use]
    pub fn post_processing_scripts(&self) -> &BTreeSet<Script> {
        &self.post_processing
    }

    /// Returns every script in execution order.
    pub fn all_scripts(&self) -> impl Iterator<Item = &Script> {
        self.indexed
            .iter()
            .chain(&self.repeatable)
            .chain(&self.post_processing)
    }

    /// Finds a script by file name.
    #[must_use]
    pub fn get(&self, file_name: &str) -> Option<&Script> {
        self.by_name.get(file_name)
    }

    /// Returns the number of scripts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexed.len() + self.repeatable.len() + self.post_processing.len()
    }

    /// Returns whether the repository holds no scripts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn assert_no_duplicate_scripts(locations: &[ScriptLocation]) -> Result<()> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for location in locations {
        for script in location.scripts() {
            if let Some(first_location) = seen.insert(script.file_name(), location.name()) {
                return Err(MaintainError::DuplicateScript {
                    file_name: script.file_name().to_string(),
                    first_location: first_location.to_string(),
                    second_location: location.name().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn assert_no_duplicate_script_indexes(indexed: &BTreeSet<Script>) -> Result<()> {
    let mut previous: Option<&Script> = None;
    for script in indexed {
        if let Some(prev) = previous {
            if prev.version() == script.version() {
                return Err(MaintainError::DuplicateScriptIndex {
                    first: prev.file_name().to_string(),
                    second: script.file_name().to_string(),
                    index: script.version().cloned().unwrap_or_default(),
                });
            }
        }
        previous = Some(script);
    }
    Ok(())
}
