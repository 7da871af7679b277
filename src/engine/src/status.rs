//! The closed lifecycle status enum shared by [`crate::task::Task`] and
//! [`crate::chain::Chain`].
//!
//! The source represents this as `TaskStatusCodes`, a class exposing string
//! class attributes that are sometimes compared as strings and sometimes as
//! enum values. Per the design note on picking one representation, this is a
//! closed Rust enum, compared by identity rather than by string value.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Initialized,
    Running,
    Complete,
    Error,
    Skipped,
    Terminating,
}

impl Status {
    /// True for any status a task does not advance past on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Complete | Status::Error | Status::Skipped
        )
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(Status::Complete.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(Status::Skipped.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Terminating.is_terminal());
    }
}
