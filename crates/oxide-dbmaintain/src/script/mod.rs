//! Script model.
//!
//! A [`Script`] is one script file: its name, content handle, checksum and
//! the classification parsed from its name. Scripts are immutable values
//! created by the [`ScriptFactory`] while scanning a location.
//!
//! # Ordering
//!
//! Scripts are totally ordered:
//!
//! - incremental scripts first, by [`ScriptIndexes`],
//! - then repeatable scripts, by file name,
//! - postprocessing scripts last, compared only among themselves with the
//!   same rules.
//!
//! Ties are broken by file name, so two scripts are equal exactly when their
//! file names are equal.

mod factory;
mod indexes;
mod qualifier;

pub use factory::ScriptFactory;
pub use indexes::ScriptIndexes;
pub use qualifier::Qualifier;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::{MaintainError, Result};

/// Computes the checksum of script content.
#[must_use]
pub fn compute_checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Where the content of a script can be read from.
#[derive(Debug, Clone)]
pub enum ScriptContent {
    /// A file on disk, read when the script is executed.
    File(PathBuf),
    /// Content held in memory.
    Text(Arc<str>),
    /// No content, e.g. for scripts reconstructed from the ledger.
    Unavailable,
}

/// One script file.
#[derive(Debug, Clone)]
pub struct Script {
    file_name: String,
    version: Option<ScriptIndexes>,
    qualifiers: BTreeSet<Qualifier>,
    patch: bool,
    target_database: Option<String>,
    post_processing: bool,
    checksum: String,
    last_modified_at: i64,
    content: ScriptContent,
}

impl Script {
    /// Returns the file name, relative to its location, with `/` separators.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Returns the version of an incremental script.
    #[must_use]
    pub fn version(&self) -> Option<&ScriptIndexes> {
        self.version.as_ref()
    }

    /// Returns the qualifiers.
    #[must_use]
    pub fn qualifiers(&self) -> &BTreeSet<Qualifier> {
        &self.qualifiers
    }

    /// Returns the name of the database the script targets, if not the
    /// default one.
    #[must_use]
    pub fn target_database(&self) -> Option<&str> {
        self.target_database.as_deref()
    }

    /// Returns the content checksum.
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Returns the modification date in milliseconds since the epoch.
    #[must_use]
    pub fn last_modified_at(&self) -> i64 {
        self.last_modified_at
    }

    /// Returns the content handle.
    #[must_use]
    pub fn content(&self) -> &ScriptContent {
        &self.content
    }

    /// Returns whether the script has a version.
    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.version.is_some() && !self.post_processing
    }

    /// Returns whether the script is re-executed on content changes.
    #[must_use]
    pub fn is_repeatable(&self) -> bool {
        self.version.is_none() && !self.post_processing
    }

    /// Returns whether the script lives in the postprocessing directory.
    #[must_use]
    pub fn is_post_processing(&self) -> bool {
        self.post_processing
    }

    /// Returns whether the script carries a patch qualifier.
    #[must_use]
    pub fn is_patch(&self) -> bool {
        self.patch
    }

    /// Returns whether the script carries the given qualifier.
    #[must_use]
    pub fn has_qualifier(&self, qualifier: &Qualifier) -> bool {
        self.qualifiers.contains(qualifier)
    }

    /// Returns whether both scripts have the same content.
    ///
    /// With `use_last_modification_dates`, equal modification dates are taken
    /// as proof of equal content and the checksums are not compared.
    #[must_use]
    pub fn is_content_equal(&self, other: &Self, use_last_modification_dates: bool) -> bool {
        if use_last_modification_dates && self.last_modified_at == other.last_modified_at {
            return true;
        }
        self.checksum == other.checksum
    }

    /// Reads the script content.
    pub async fn read_content(&self) -> Result<String> {
        match &self.content {
            ScriptContent::File(path) => Ok(tokio::fs::read_to_string(path).await?),
            ScriptContent::Text(text) => Ok(text.to_string()),
            ScriptContent::Unavailable => Err(MaintainError::ContentUnavailable(self.file_name.clone())),
        }
    }

    fn rank(&self) -> u8 {
        match (self.post_processing, self.version.is_some()) {
            (false, true) => 0,
            (false, false) => 1,
            (true, true) => 2,
            (true, false) => 3,
        }
    }
}

impl PartialEq for Script {
    fn eq(&self, other: &Self) -> bool {
        self.file_name == other.file_name
    }
}

impl Eq for Script {}

impl PartialOrd for Script {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Script {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.file_name == other.file_name {
            return Ordering::Equal;
        }
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.file_name.cmp(&other.file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptConfig;

    fn factory() -> ScriptFactory {
        ScriptFactory::new(&ScriptConfig::default()).unwrap()
    }

    fn script(name: &str) -> Script {
        factory().create_from_text(name, "select 1;", 0).unwrap()
    }

    #[test]
    fn test_checksum_ignores_modification_date() {
        let f = factory();
        let a = f.create_from_text("1_a.sql", "create table a (id int);", 10).unwrap();
        let b = f.create_from_text("1_a.sql", "create table a (id int);", 20).unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn test_content_equality() {
        let f = factory();
        let a = f.create_from_text("1_a.sql", "one", 10).unwrap();
        let same_date = f.create_from_text("1_a.sql", "two", 10).unwrap();
        let same_content = f.create_from_text("1_a.sql", "one", 20).unwrap();

        assert!(a.is_content_equal(&same_date, true));
        assert!(!a.is_content_equal(&same_date, false));
        assert!(a.is_content_equal(&same_content, true));
        assert!(a.is_content_equal(&same_content, false));
    }

    #[test]
    fn test_ordering() {
        let mut scripts = vec![
            script("postprocessing/01_grants.sql"),
            script("views.sql"),
            script("10_c.sql"),
            script("2_b.sql"),
            script("postprocessing/analyze.sql"),
            script("1_a.sql"),
            script("functions.sql"),
            script("1_1_sub.sql"),
        ];
        scripts.sort();
        let names: Vec<&str> = scripts.iter().map(Script::file_name).collect();
        assert_eq!(
            names,
            vec![
                "1_a.sql",
                "1_1_sub.sql",
                "2_b.sql",
                "10_c.sql",
                "functions.sql",
                "views.sql",
                "postprocessing/01_grants.sql",
                "postprocessing/analyze.sql",
            ]
        );
    }

    #[test]
    fn test_equality_by_file_name() {
        let f = factory();
        let a = f.create_from_text("1_a.sql", "one", 1).unwrap();
        let b = f.create_from_text("1_a.sql", "two", 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_ne!(a, script("1_b.sql"));
    }

    #[test]
    fn test_classification() {
        assert!(script("1_a.sql").is_incremental());
        assert!(script("a.sql").is_repeatable());
        let post = script("postprocessing/1_a.sql");
        assert!(post.is_post_processing());
        assert!(!post.is_incremental());
        assert!(!post.is_repeatable());
    }

    #[tokio::test]
    async fn test_read_content() {
        let s = script("1_a.sql");
        assert_eq!(s.read_content().await.unwrap(), "select 1;");

        let snapshot = factory()
            .create_executed_snapshot("1_a.sql", 0, s.checksum().to_string())
            .unwrap();
        assert!(matches!(
            snapshot.read_content().await,
            Err(MaintainError::ContentUnavailable(_))
        ));
    }
}
