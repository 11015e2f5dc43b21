//! The file-locked JSON state store.
//!
//! A single state document owns every story record. All modifications follow
//! one protocol: acquire the advisory lock on the sibling `.lock` file, read
//! the document, apply the change, write to a sibling temp file, and
//! atomically rename it over the original. Only the orchestrator writes;
//! workers read through the same lock.

use crate::errors::OrchestratorError;
use crate::state::lock::{FileLock, LOCK_TIMEOUT};
use crate::workflow::model::{Story, StoryStatus, WorkflowState};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Handle to the on-disk state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    lock_timeout: Duration,
}

impl StateStore {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Override the lock acquisition timeout (tests use short values).
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut os = self.state_path.clone().into_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    /// Read the current document without taking the lock.
    ///
    /// Safe for point-in-time snapshots: writers always rename a fully
    /// written temp file into place, so a read never observes a torn write.
    pub fn load(&self) -> Result<WorkflowState, OrchestratorError> {
        let text = std::fs::read_to_string(&self.state_path).map_err(|source| {
            OrchestratorError::StateReadFailed {
                path: self.state_path.clone(),
                source,
            }
        })?;
        serde_json::from_str(&text).map_err(|source| OrchestratorError::StateCorrupt {
            path: self.state_path.clone(),
            source,
        })
    }

    /// Write the document atomically: temp file in the same directory, then
    /// rename over the original.
    pub fn save(&self, state: &WorkflowState) -> Result<(), OrchestratorError> {
        let parent = self
            .state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|source| OrchestratorError::StateWriteFailed {
            path: self.state_path.clone(),
            source,
        })?;

        let mut content = serde_json::to_string_pretty(state).map_err(|e| {
            OrchestratorError::Other(anyhow::anyhow!("serialize state document: {e}"))
        })?;
        content.push('\n');

        let mut tmp = tempfile::Builder::new()
            .prefix(".state_")
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|source| OrchestratorError::StateWriteFailed {
                path: self.state_path.clone(),
                source,
            })?;
        tmp.write_all(content.as_bytes())
            .map_err(|source| OrchestratorError::StateWriteFailed {
                path: self.state_path.clone(),
                source,
            })?;
        tmp.persist(&self.state_path)
            .map_err(|e| OrchestratorError::StateWriteFailed {
                path: self.state_path.clone(),
                source: e.error,
            })?;
        Ok(())
    }

    /// Run a mutation under the lock: acquire, load, apply, save, release.
    ///
    /// This is the only mutation entry point. The closure's return value is
    /// passed through, so callers can extract data from the same snapshot
    /// their write was based on.
    pub fn with_locked<T>(
        &self,
        f: impl FnOnce(&mut WorkflowState) -> T,
    ) -> Result<T, OrchestratorError> {
        let _lock = FileLock::acquire(&self.lock_path(), self.lock_timeout)?;
        let mut state = self.load()?;
        let out = f(&mut state);
        self.save(&state)?;
        Ok(out)
    }

    /// Create the initial state document from pre-validated stories.
    ///
    /// Dependency-graph validation happens before this is called, so a cycle
    /// aborts startup without any state reaching disk.
    pub fn initialize(
        &self,
        stories: Vec<Story>,
        manifest_file: &str,
    ) -> Result<WorkflowState, OrchestratorError> {
        let mut state = WorkflowState::new(manifest_file);
        for story in stories {
            state.stories.insert(story.id.clone(), story);
        }
        self.save(&state)?;
        Ok(state)
    }
}

/// First unclaimed story whose dependencies are all completed, in key order.
pub fn find_assignable_story(state: &WorkflowState) -> Option<String> {
    let completed: Vec<&str> = state
        .stories
        .values()
        .filter(|s| s.status == StoryStatus::Completed)
        .map(|s| s.id.as_str())
        .collect();

    state
        .stories
        .values()
        .find(|story| {
            story.status == StoryStatus::Unclaimed
                && story
                    .depends_on
                    .iter()
                    .all(|dep| completed.contains(&dep.as_str()))
        })
        .map(|story| story.id.clone())
}

/// Move every story that depends, directly or transitively, on a failed
/// story from unclaimed to blocked.
///
/// Runs to a fixed point so chains of dependents all block in one pass.
pub fn block_dependents(state: &mut WorkflowState, failed_story_id: &str) {
    let mut failed_ids: Vec<String> = state
        .stories
        .values()
        .filter(|s| matches!(s.status, StoryStatus::Failed | StoryStatus::Blocked))
        .map(|s| s.id.clone())
        .collect();
    if !failed_ids.iter().any(|id| id == failed_story_id) {
        failed_ids.push(failed_story_id.to_string());
    }

    let mut changed = true;
    while changed {
        changed = false;
        let to_block: Vec<String> = state
            .stories
            .values()
            .filter(|story| {
                story.status == StoryStatus::Unclaimed
                    && story.depends_on.iter().any(|dep| failed_ids.contains(dep))
            })
            .map(|s| s.id.clone())
            .collect();

        for id in to_block {
            if let Some(story) = state.stories.get_mut(&id) {
                story.status = StoryStatus::Blocked;
                failed_ids.push(id);
                changed = true;
            }
        }
    }
}

/// Return blocked stories to the unclaimed pool once every dependency shows
/// completed. The inverse of [`block_dependents`], applied each loop turn.
pub fn reevaluate_blocked(state: &mut WorkflowState) {
    let completed: Vec<String> = state
        .stories
        .values()
        .filter(|s| s.status == StoryStatus::Completed)
        .map(|s| s.id.clone())
        .collect();

    let unblockable: Vec<String> = state
        .stories
        .values()
        .filter(|story| {
            story.status == StoryStatus::Blocked
                && story.depends_on.iter().all(|dep| completed.contains(dep))
        })
        .map(|s| s.id.clone())
        .collect();

    for id in unblockable {
        if let Some(story) = state.stories.get_mut(&id) {
            story.status = StoryStatus::Unclaimed;
        }
    }
}
