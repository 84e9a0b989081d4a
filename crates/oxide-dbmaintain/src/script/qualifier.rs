//! Script qualifiers.

use std::fmt;

use crate::error::{MaintainError, Result};

/// A label attached to a script through its file name, e.g. `patch` in
/// `03_#patch_fix_totals.sql`.
///
/// Qualifiers are case-insensitive and stored in lower case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Qualifier(String);

impl Qualifier {
    /// Creates a qualifier, rejecting empty names and names containing
    /// anything other than letters, digits and `-`.
    pub fn new(name: &str) -> Result<Self> {
        Self::parse(name).ok_or_else(|| MaintainError::config(format!("invalid qualifier '{}'", name)))
    }

    /// Parses a qualifier name, returning `None` when it is malformed.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return None;
        }
        Some(Self(name.to_ascii_lowercase()))
    }

    /// Returns the qualifier name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Qualifier::parse("Patch").unwrap().as_str(), "patch");
        assert_eq!(Qualifier::parse("pre-prod").unwrap().as_str(), "pre-prod");
        assert!(Qualifier::parse("").is_none());
        assert!(Qualifier::parse("a b").is_none());
        assert!(Qualifier::parse("x.y").is_none());
    }

    #[test]
    fn test_new_reports_invalid_name() {
        assert!(matches!(Qualifier::new("#"), Err(MaintainError::Config(_))));
    }
}
