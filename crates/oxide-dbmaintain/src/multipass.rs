//! Retrying operations that may fail because of ordering.
//!
//! Dropping or emptying database objects can fail when another object still
//! depends on them. Instead of computing the exact order, the failing items
//! are retried in a new pass for as long as every pass makes progress.

use tracing::debug;

use crate::error::{MaintainError, Result};

/// Tracks the errors of one pass and decides whether another pass is worth
/// running.
#[derive(Debug, Default)]
pub struct MultiPassErrorHandler {
    pass: usize,
    previous_error_count: Option<usize>,
    errors: Vec<MaintainError>,
}

impl MultiPassErrorHandler {
    /// Creates a handler for the first pass.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure of the current pass.
    pub fn add_error(&mut self, error: MaintainError) {
        debug!(pass = self.pass + 1, error = %error, "Item failed, will retry");
        self.errors.push(error);
    }

    /// Returns the number of failures of the current pass.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Ends the current pass.
    ///
    /// Returns `Ok(false)` when the pass had no errors, `Ok(true)` when
    /// another pass should run, and the first error of the pass when the
    /// pass made no progress compared to the previous one.
    pub fn continue_execution_after_pass(&mut self) -> Result<bool> {
        self.pass += 1;
        let count = self.errors.len();
        if count == 0 {
            return Ok(false);
        }
        let progressed = self.previous_error_count.map_or(true, |previous| count < previous);
        if !progressed {
            let mut errors = std::mem::take(&mut self.errors);
            return Err(errors.swap_remove(0));
        }
        debug!(pass = self.pass, errors = count, "Starting another pass");
        self.previous_error_count = Some(count);
        self.errors.clear();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(name: &str) -> MaintainError {
        MaintainError::config(name)
    }

    #[test]
    fn test_clean_pass_stops() {
        let mut handler = MultiPassErrorHandler::new();
        assert!(!handler.continue_execution_after_pass().unwrap());
    }

    #[test]
    fn test_first_pass_with_errors_continues() {
        let mut handler = MultiPassErrorHandler::new();
        handler.add_error(error("a"));
        handler.add_error(error("b"));
        assert!(handler.continue_execution_after_pass().unwrap());
        assert_eq!(handler.error_count(), 0);
    }

    #[test]
    fn test_progress_continues_until_clean() {
        let mut handler = MultiPassErrorHandler::new();
        handler.add_error(error("a"));
        handler.add_error(error("b"));
        assert!(handler.continue_execution_after_pass().unwrap());

        handler.add_error(error("b"));
        assert!(handler.continue_execution_after_pass().unwrap());

        assert!(!handler.continue_execution_after_pass().unwrap());
    }

    #[test]
    fn test_no_progress_returns_first_error_of_pass() {
        let mut handler = MultiPassErrorHandler::new();
        handler.add_error(error("a"));
        handler.add_error(error("b"));
        assert!(handler.continue_execution_after_pass().unwrap());

        handler.add_error(error("c"));
        handler.add_error(error("d"));
        let err = handler.continue_execution_after_pass().unwrap_err();
        assert_eq!(err.to_string(), "Invalid configuration: c");
    }

    #[test]
    fn test_more_errors_than_before_fails() {
        let mut handler = MultiPassErrorHandler::new();
        handler.add_error(error("a"));
        assert!(handler.continue_execution_after_pass().unwrap());

        handler.add_error(error("b"));
        handler.add_error(error("c"));
        assert!(handler.continue_execution_after_pass().is_err());
    }
}
