//! Typed error hierarchy for the Weaver orchestrator.
//!
//! Two top-level enums cover the subsystems callers need to match on:
//! - `OrchestratorError` — state-store, lock, and agent-launch failures
//! - `EditError` — workflow-edit parsing and guardrail violations
//!
//! Configuration errors (bad manifest, dependency cycles) are fatal at
//! startup and flow through `anyhow` with context instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the orchestrator core (state store, locks, agent launch).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Could not acquire lock on {path} within {seconds}s")]
    LockTimeout { path: PathBuf, seconds: u64 },

    #[error("Failed to read state document at {path}: {source}")]
    StateReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state document at {path}: {source}")]
    StateWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State document at {path} is corrupt: {source}")]
    StateCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Story {0} not found in state document")]
    StoryNotFound(String),

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Git command failed: {0}")]
    Git(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from parsing or validating a workflow edit file.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("Invalid edit file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Edit file must contain an operation object or a list of them")]
    NotAnOperationList,

    #[error("Edit rejected by worker check: worker {requesting} is not assigned to story {story_id}")]
    WrongWorker { story_id: String, requesting: u32 },

    #[error("{}", .0.join("; "))]
    Validation(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_carries_path_and_seconds() {
        let err = OrchestratorError::LockTimeout {
            path: PathBuf::from("/run/state.json.lock"),
            seconds: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("state.json.lock"));
        assert!(msg.contains("60s"));
    }

    #[test]
    fn validation_error_joins_reasons() {
        let err = EditError::Validation(vec![
            "skip: cannot skip mandatory step kind 'linting'".to_string(),
            "restart: step 'step-005' has reached max restarts (3)".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("linting"));
        assert!(msg.contains("; "));
        assert!(msg.contains("max restarts"));
    }

    #[test]
    fn orchestrator_error_is_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::StoryNotFound("US-001".into()));
        assert_std_error(&EditError::NotAnOperationList);
    }

    #[test]
    fn state_corrupt_wraps_serde_error() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = OrchestratorError::StateCorrupt {
            path: PathBuf::from("state.json"),
            source: serde_err,
        };
        assert!(err.to_string().contains("corrupt"));
    }
}
