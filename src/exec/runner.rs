//! Story runner: drives one story's step sequence to completion or failure.
//!
//! Each iteration reloads state (so workflow edits are picked up), finds the
//! first pending step, and hands it to the executor. Steps are strictly
//! sequential within a story — each step's input is the prior step's output.
//!
//! The runner reports success once no pending steps remain; the story is
//! marked completed by the caller only after its work has integrated into
//! the base, so dependents never start against a base missing their
//! dependency's changes.

use crate::config::Config;
use crate::exec::executor::StepExecutor;
use crate::progress::Reporter;
use crate::state::scratch;
use crate::state::store::StateStore;
use crate::workflow::model::{HistoryAction, HistoryEntry, StepStatus, StoryStatus};
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;

/// Drives a single assigned story inside one workspace.
pub struct StoryRunner<'a> {
    config: &'a Config,
    store: &'a StateStore,
    reporter: &'a Reporter,
    workdir: PathBuf,
    worker_id: u32,
}

impl<'a> StoryRunner<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a StateStore,
        reporter: &'a Reporter,
        workdir: PathBuf,
        worker_id: u32,
    ) -> Self {
        Self {
            config,
            store,
            reporter,
            workdir,
            worker_id,
        }
    }

    /// Run the story's steps until none remain or one fails.
    ///
    /// Returns true when every step finished (completed or skipped); false
    /// when the story was marked failed.
    pub async fn run(&self, story_id: &str) -> Result<bool> {
        let executor = StepExecutor::new(
            self.config,
            self.store,
            self.reporter,
            self.workdir.clone(),
            self.worker_id,
        );

        loop {
            // Reload each iteration to pick up workflow edits.
            let state = self.store.load()?;
            let Some(mut story) = state.stories.get(story_id).cloned() else {
                self.reporter
                    .detail(&format!("story {story_id} disappeared from state"));
                return Ok(false);
            };

            // A failed or cancelled step without a failed story only arises
            // after crash reconciliation; the re-run surfaces it as a story
            // failure instead of executing past it.
            if let Some(broken) = story
                .steps
                .iter()
                .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::Cancelled))
            {
                let step_id = broken.id.clone();
                self.mark_story_failed(story_id, &step_id, "prior step failure")?;
                return Ok(false);
            }

            let Some(step) = story.find_next_pending_step() else {
                // No pending steps remain. Edits can never remove or
                // displace final_review, so the last completed step is the
                // mandatory closing kind.
                self.reporter
                    .detail(&format!("story {story_id}: all steps completed"));
                return Ok(true);
            };
            let step_id = step.id.clone();

            let status = executor.execute(&mut story, &step_id).await?;

            match status {
                StepStatus::Completed | StepStatus::Pending => {
                    // Pending means the agent restarted its own step; the
                    // next iteration re-invokes it with the new description.
                    continue;
                }
                StepStatus::Cancelled => {
                    self.mark_story_failed(story_id, &step_id, "timed out")?;
                    return Ok(false);
                }
                StepStatus::Failed => {
                    self.mark_story_failed(story_id, &step_id, "step failed")?;
                    return Ok(false);
                }
                StepStatus::InProgress | StepStatus::Skipped => {
                    // The executor never returns these; treat as a wedged
                    // story rather than looping forever.
                    self.mark_story_failed(story_id, &step_id, "executor returned invalid status")?;
                    return Ok(false);
                }
            }
        }
    }

    /// Record story completion: status, timestamp, history, scratch archive.
    ///
    /// Called after the story's work has landed (post-integration in
    /// scheduled mode, directly in one-shot mode).
    pub fn complete(&self, story_id: &str) -> Result<()> {
        let worker_id = self.worker_id;
        self.store.with_locked({
            let story_id = story_id.to_string();
            move |state| {
                if let Some(story) = state.stories.get_mut(&story_id) {
                    story.status = StoryStatus::Completed;
                    story.completed_at = Some(Utc::now());
                    story.push_history(HistoryEntry::new(
                        HistoryAction::StoryCompleted,
                        Some(worker_id),
                        None,
                    ));
                }
            }
        })?;

        // Archival keeps composed prompts from growing without bound across
        // later stories.
        scratch::archive_story(&self.config.run_dir, story_id)?;
        Ok(())
    }

    fn mark_story_failed(&self, story_id: &str, step_id: &str, reason: &str) -> Result<()> {
        let worker_id = self.worker_id;
        let step_kind = self
            .store
            .load()
            .ok()
            .and_then(|state| {
                state
                    .stories
                    .get(story_id)
                    .and_then(|s| s.find_step(step_id).map(|st| st.kind.as_str()))
            })
            .unwrap_or("unknown");

        self.store.with_locked({
            let story_id = story_id.to_string();
            let step_id = step_id.to_string();
            move |state| {
                if let Some(story) = state.stories.get_mut(&story_id) {
                    story.status = StoryStatus::Failed;
                    story.completed_at = Some(Utc::now());
                    story.push_history(HistoryEntry::new(
                        HistoryAction::StoryFailed,
                        Some(worker_id),
                        Some(&step_id),
                    ));
                }
            }
        })?;

        scratch::append_global(
            &self.config.run_dir,
            &format!(
                "[{}] Story {story_id} FAILED at step {step_id} ({step_kind}) — {reason}",
                Utc::now().to_rfc3339()
            ),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Story;
    use crate::workflow::steps::default_workflow;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, Config, StateStore, Reporter) {
        let project = tempdir().unwrap();
        let run = tempdir().unwrap();
        let config = Config::new(
            project.path().to_path_buf(),
            run.path().to_path_buf(),
            false,
        )
        .unwrap();
        let store = StateStore::new(config.state_path())
            .with_lock_timeout(std::time::Duration::from_secs(2));
        let reporter = Reporter::new(1, config.summary_log_path(), false);
        (project, run, config, store, reporter)
    }

    fn finished_story(id: &str) -> Story {
        let mut story = Story::new(id, "All done");
        story.status = StoryStatus::InProgress;
        story.worker_id = Some(1);
        story.steps = default_workflow();
        for step in &mut story.steps {
            step.status = StepStatus::Completed;
            step.notes = Some("done".into());
        }
        story
    }

    #[tokio::test]
    async fn test_story_with_no_pending_steps_reports_success() {
        let (_p, _r, config, store, reporter) = setup();
        store
            .initialize(vec![finished_story("US-001")], "prd.json")
            .unwrap();

        let runner = StoryRunner::new(&config, &store, &reporter, config.project_dir.clone(), 1);
        assert!(runner.run("US-001").await.unwrap());

        // run() itself does not flip the status; complete() does
        let state = store.load().unwrap();
        assert_eq!(state.stories["US-001"].status, StoryStatus::InProgress);
    }

    #[tokio::test]
    async fn test_complete_marks_story_and_archives_scratch() {
        let (_p, _r, config, store, reporter) = setup();
        store
            .initialize(vec![finished_story("US-001")], "prd.json")
            .unwrap();
        scratch::write_story(&config.run_dir, "US-001", "notes").unwrap();

        let runner = StoryRunner::new(&config, &store, &reporter, config.project_dir.clone(), 1);
        runner.complete("US-001").unwrap();

        let state = store.load().unwrap();
        let story = &state.stories["US-001"];
        assert_eq!(story.status, StoryStatus::Completed);
        assert!(story.completed_at.is_some());
        assert!(story
            .history
            .iter()
            .any(|h| h.action == HistoryAction::StoryCompleted));
        assert_eq!(scratch::read_story(&config.run_dir, "US-001"), "");
        assert!(config.run_dir.join("scratch_US-001.archived.md").exists());
    }

    #[tokio::test]
    async fn test_reconciled_story_with_failed_step_fails_on_rerun() {
        let (_p, _r, config, store, reporter) = setup();
        let mut story = finished_story("US-001");
        // crash left step-005 failed, later steps still pending
        for step in &mut story.steps[4..] {
            step.status = StepStatus::Pending;
            step.notes = None;
        }
        story.steps[4].status = StepStatus::Failed;
        story.steps[4].error = Some("orchestrator crash".into());
        store.initialize(vec![story], "prd.json").unwrap();

        let runner = StoryRunner::new(&config, &store, &reporter, config.project_dir.clone(), 1);
        assert!(!runner.run("US-001").await.unwrap());

        let state = store.load().unwrap();
        assert_eq!(state.stories["US-001"].status, StoryStatus::Failed);
        assert!(scratch::read_global(&config.run_dir).contains("US-001"));
    }

    #[tokio::test]
    async fn test_missing_story_returns_false() {
        let (_p, _r, config, store, reporter) = setup();
        store.initialize(vec![], "prd.json").unwrap();
        let runner = StoryRunner::new(&config, &store, &reporter, config.project_dir.clone(), 1);
        assert!(!runner.run("US-404").await.unwrap());
    }
}
