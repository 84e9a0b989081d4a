//! Script version indexes.

use std::fmt;
use std::str::FromStr;

use crate::error::MaintainError;

/// Version of an incremental script: the numeric segments leading its file
/// name (and the names of its indexed parent directories).
///
/// `01_tables/02_users.sql` has indexes `1.2`. Comparison is element-wise and
/// a prefix sorts before every longer tuple that extends it, so `1 < 1.1 < 2`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptIndexes(Vec<u64>);

impl ScriptIndexes {
    /// Creates indexes from their segments.
    #[must_use]
    pub fn new(indexes: Vec<u64>) -> Self {
        Self(indexes)
    }

    /// Returns the segments.
    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    /// Returns whether there are no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns whether these indexes sort before the given baseline.
    #[must_use]
    pub fn is_below(&self, baseline: &Self) -> bool {
        self < baseline
    }
}

impl fmt::Display for ScriptIndexes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Parses `1.2.3` or `1_2_3`.
impl FromStr for ScriptIndexes {
    type Err = MaintainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MaintainError::InvalidScriptIndexes(s.to_string()));
        }
        trimmed
            .split(['.', '_'])
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| MaintainError::InvalidScriptIndexes(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}
