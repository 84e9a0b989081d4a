//! Creation of scripts from file names.
//!
//! A script name is split into `/`-separated path components and each
//! component into `_`-separated tokens:
//!
//! ```text
//! postprocessing/  @users_  02_  #patch_  fix_totals.sql
//! ^ directory      ^ target ^ idx ^ qualifier ^ name
//! ```
//!
//! - a leading component equal to the postprocessing directory marks a
//!   postprocessing script,
//! - tokens starting with the target database prefix name the database,
//! - tokens starting with the qualifier prefix are qualifiers,
//! - numeric tokens before the first name token are indexes.
//!
//! The script is incremental when its file name itself carries indexes. Its
//! version is then the concatenation of the indexes of all components.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::config::ScriptConfig;
use crate::error::{MaintainError, Result};

use super::{compute_checksum, Qualifier, Script, ScriptContent, ScriptIndexes};

/// Creates scripts, parsing their names with the configured conventions.
#[derive(Debug, Clone)]
pub struct ScriptFactory {
    qualifier_prefix: String,
    target_database_prefix: String,
    postprocessing_dir: String,
    extensions: Vec<String>,
    registered_qualifiers: BTreeSet<Qualifier>,
    patch_qualifiers: BTreeSet<Qualifier>,
}

struct ParsedName {
    version: Option<ScriptIndexes>,
    qualifiers: BTreeSet<Qualifier>,
    target_database: Option<String>,
    post_processing: bool,
}

impl ScriptFactory {
    /// Creates a factory from the script configuration.
    pub fn new(config: &ScriptConfig) -> Result<Self> {
        Ok(Self {
            qualifier_prefix: config.qualifier_prefix.clone(),
            target_database_prefix: config.target_database_prefix.clone(),
            postprocessing_dir: config.postprocessing_dir.trim_matches('/').to_string(),
            extensions: config
                .extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            registered_qualifiers: config.registered_qualifiers()?.into_iter().collect(),
            patch_qualifiers: config.patch_qualifier_set()?.into_iter().collect(),
        })
    }

    /// Returns whether the file name has one of the configured extensions.
    #[must_use]
    pub fn has_script_extension(&self, file_name: &str) -> bool {
        let Some((_, ext)) = file_name.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().any(|e| *e == ext)
    }

    /// Creates a script whose content is held in memory.
    pub fn create_from_text(
        &self,
        file_name: &str,
        content: &str,
        last_modified_at: i64,
    ) -> Result<Script> {
        let checksum = compute_checksum(content.as_bytes());
        self.create(
            file_name,
            last_modified_at,
            checksum,
            ScriptContent::Text(Arc::from(content)),
            true,
        )
    }

    /// Creates a script for a file on disk. The file is hashed now and read
    /// again when the script is executed.
    pub fn create_from_file(&self, file_name: &str, path: &Path) -> Result<Script> {
        let bytes = std::fs::read(path)?;
        let last_modified_at = std::fs::metadata(path)?
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .and_then(|elapsed| i64::try_from(elapsed.as_millis()).ok())
            .unwrap_or(0);
        self.create(
            file_name,
            last_modified_at,
            compute_checksum(&bytes),
            ScriptContent::File(path.to_path_buf()),
            true,
        )
    }

    /// Reconstructs a script from a ledger row. Qualifiers are not checked
    /// against the registered ones, since the configuration may have changed
    /// since the script was executed.
    pub fn create_executed_snapshot(
        &self,
        file_name: &str,
        last_modified_at: i64,
        checksum: String,
    ) -> Result<Script> {
        self.create(
            file_name,
            last_modified_at,
            checksum,
            ScriptContent::Unavailable,
            false,
        )
    }

    fn create(
        &self,
        file_name: &str,
        last_modified_at: i64,
        checksum: String,
        content: ScriptContent,
        check_registration: bool,
    ) -> Result<Script> {
        let file_name = file_name.replace('\\', "/");
        let parsed = self.parse_name(&file_name, check_registration)?;
        let patch = parsed
            .qualifiers
            .iter()
            .any(|q| self.patch_qualifiers.contains(q));
        Ok(Script {
            file_name,
            version: parsed.version,
            qualifiers: parsed.qualifiers,
            patch,
            target_database: parsed.target_database,
            post_processing: parsed.post_processing,
            checksum,
            last_modified_at,
            content,
        })
    }

    fn parse_name(&self, file_name: &str, check_registration: bool) -> Result<ParsedName> {
        let invalid = |reason: &str| MaintainError::InvalidScriptName {
            file_name: file_name.to_string(),
            reason: reason.to_string(),
        };

        let mut components: Vec<&str> = file_name.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Err(invalid("empty name"));
        }
        let post_processing = components.len() > 1
            && !self.postprocessing_dir.is_empty()
            && components[0].eq_ignore_ascii_case(&self.postprocessing_dir);
        if post_processing {
            components.remove(0);
        }

        let last = components.len() - 1;
        let mut indexes = Vec::new();
        let mut file_indexed = false;
        let mut qualifiers = BTreeSet::new();
        let mut target_database: Option<String> = None;

        for (position, &component) in components.iter().enumerate() {
            let stem = if position == last {
                component.rsplit_once('.').map_or(component, |(stem, _)| stem)
            } else {
                component
            };

            let mut leading = true;
            for token in stem.split('_') {
                if let Some(database) = token.strip_prefix(self.target_database_prefix.as_str()) {
                    if database.is_empty() {
                        return Err(invalid("empty target database name"));
                    }
                    if target_database.is_some() {
                        return Err(invalid("more than one target database"));
                    }
                    target_database = Some(database.to_string());
                    continue;
                }
                if let Some(name) = token.strip_prefix(self.qualifier_prefix.as_str()) {
                    let qualifier =
                        Qualifier::parse(name).ok_or_else(|| MaintainError::MalformedQualifier {
                            token: token.to_string(),
                            file_name: file_name.to_string(),
                        })?;
                    if check_registration && !self.registered_qualifiers.contains(&qualifier) {
                        return Err(MaintainError::UnregisteredQualifier {
                            qualifier: qualifier.to_string(),
                            used_in: format!("script '{}'", file_name),
                        });
                    }
                    qualifiers.insert(qualifier);
                    continue;
                }
                if leading && !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
                    let index = token
                        .parse::<u64>()
                        .map_err(|_| invalid("index out of range"))?;
                    indexes.push(index);
                    if position == last {
                        file_indexed = true;
                    }
                    continue;
                }
                leading = false;
            }
        }

        Ok(ParsedName {
            version: file_indexed.then(|| ScriptIndexes::new(indexes)),
            qualifiers,
            target_database,
            post_processing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ScriptFactory {
        let config = ScriptConfig {
            qualifiers: vec!["demo".to_string(), "prod".to_string()],
            ..ScriptConfig::default()
        };
        ScriptFactory::new(&config).unwrap()
    }

    fn parse(name: &str) -> Script {
        factory().create_from_text(name, "", 0).unwrap()
    }

    fn version(name: &str) -> Option<String> {
        parse(name).version().map(ToString::to_string)
    }

    #[test]
    fn test_indexes() {
        assert_eq!(version("1_create_users.sql").as_deref(), Some("1"));
        assert_eq!(version("001_002_users.sql").as_deref(), Some("1.2"));
        assert_eq!(version("01_tables/02_users.sql").as_deref(), Some("1.2"));
        assert_eq!(version("tables/02_users.sql").as_deref(), Some("2"));
        assert_eq!(version("1_users_2.sql").as_deref(), Some("1"));
        assert_eq!(version("views.sql"), None);
        assert_eq!(version("01_tables/views.sql"), None);
    }

    #[test]
    fn test_qualifiers_and_patch() {
        let script = parse("3_#patch_#Demo_fix_totals.sql");
        assert_eq!(script.version().unwrap().to_string(), "3");
        assert!(script.is_patch());
        assert!(script.has_qualifier(&Qualifier::new("demo").unwrap()));
        assert_eq!(script.qualifiers().len(), 2);

        let plain = parse("3_fix_totals.sql");
        assert!(!plain.is_patch());
        assert!(plain.qualifiers().is_empty());
    }

    #[test]
    fn test_target_database() {
        let script = parse("@users_01_create.sql");
        assert_eq!(script.target_database(), Some("users"));
        assert_eq!(script.version().unwrap().to_string(), "1");

        let nested = parse("@users/01_create.sql");
        assert_eq!(nested.target_database(), Some("users"));

        assert_eq!(parse("01_create.sql").target_database(), None);
    }

    #[test]
    fn test_two_target_databases_rejected() {
        let result = factory().create_from_text("@a_@b_01_x.sql", "", 0);
        assert!(matches!(result, Err(MaintainError::InvalidScriptName { .. })));
    }

    #[test]
    fn test_post_processing() {
        let script = parse("postprocessing/01_grants.sql");
        assert!(script.is_post_processing());
        assert_eq!(script.file_name(), "postprocessing/01_grants.sql");

        assert!(!parse("postprocessing.sql").is_post_processing());
        assert!(!parse("other/postprocessing/x.sql").is_post_processing());
    }

    #[test]
    fn test_backslashes_normalized() {
        let script = parse("postprocessing\\grants.sql");
        assert!(script.is_post_processing());
        assert_eq!(script.file_name(), "postprocessing/grants.sql");
    }

    #[test]
    fn test_malformed_qualifier() {
        let result = factory().create_from_text("1_#_x.sql", "", 0);
        assert!(matches!(result, Err(MaintainError::MalformedQualifier { .. })));

        let result = factory().create_from_text("1_#a.b_x.sql", "", 0);
        assert!(matches!(result, Err(MaintainError::MalformedQualifier { .. })));
    }

    #[test]
    fn test_unregistered_qualifier() {
        let result = factory().create_from_text("1_#staging_x.sql", "", 0);
        match result {
            Err(MaintainError::UnregisteredQualifier { qualifier, used_in }) => {
                assert_eq!(qualifier, "staging");
                assert!(used_in.contains("1_#staging_x.sql"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let snapshot = factory()
            .create_executed_snapshot("1_#staging_x.sql", 0, String::new())
            .unwrap();
        assert_eq!(snapshot.qualifiers().len(), 1);
    }

    #[test]
    fn test_extensions() {
        let f = factory();
        assert!(f.has_script_extension("1_a.sql"));
        assert!(f.has_script_extension("1_a.DDL"));
        assert!(!f.has_script_extension("readme.txt"));
        assert!(!f.has_script_extension("Makefile"));
    }

    #[test]
    fn test_create_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1_a.sql");
        std::fs::write(&path, "create table a (id int);").unwrap();

        let script = factory().create_from_file("1_a.sql", &path).unwrap();
        assert_eq!(script.checksum(), compute_checksum(b"create table a (id int);"));
        assert!(script.last_modified_at() > 0);
        assert!(matches!(script.content(), ScriptContent::File(_)));
    }
}
