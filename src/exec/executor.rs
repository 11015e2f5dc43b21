//! Step execution engine.
//!
//! Runs a single workflow step end to end: records the pre-start revision
//! and marks the step in_progress under the state lock, composes the prompt,
//! launches the agent bounded by the kind's timeout, then consumes any
//! pending edit request and writes the result back — edits and the status
//! transition land in one locked write so observers see both or neither.

use crate::config::Config;
use crate::errors::EditError;
use crate::exec::agent::{extract_summary, launch_agent, AgentOutcome};
use crate::git::Git;
use crate::progress::Reporter;
use crate::state::scratch;
use crate::state::store::StateStore;
use crate::workflow::edit::{
    apply_edits, discard_edit_file, parse_edit_file, remove_edit_file, validate_edits,
};
use crate::workflow::model::{HistoryAction, HistoryEntry, StepStatus, Story};
use crate::workflow::prompt::compose_step_prompt;
use crate::workflow::steps::step_timeout;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;

/// Executes steps for one assigned story inside one workspace.
pub struct StepExecutor<'a> {
    config: &'a Config,
    store: &'a StateStore,
    reporter: &'a Reporter,
    workdir: PathBuf,
    worker_id: u32,
}

impl<'a> StepExecutor<'a> {
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

    /// Execute one step and return its final status.
    ///
    /// `story` is the caller's working copy; the step list, history, and the
    /// step record are synced back to the persisted story under the lock.
    pub async fn execute(&self, story: &mut Story, step_id: &str) -> Result<StepStatus> {
        let story_id = story.id.clone();
        let git = Git::new(&self.workdir);

        // (1) Record pre-start revision, transition to in_progress, stamp
        // start time — all under the lock before the agent launches.
        let rev_at_start = git.head_rev()?;
        let started_at = Utc::now();
        {
            let step = story
                .find_step_mut(step_id)
                .with_context(|| format!("step {step_id} missing from story {story_id}"))?;
            step.status = StepStatus::InProgress;
            step.started_at = Some(started_at);
            step.rev_at_start = Some(rev_at_start.clone());
        }
        story.push_history(HistoryEntry::new(
            HistoryAction::StepStarted,
            Some(self.worker_id),
            Some(step_id),
        ));
        self.persist_story(story)?;

        let step = story
            .find_step(step_id)
            .with_context(|| format!("step {step_id} missing from story {story_id}"))?
            .clone();
        self.reporter
            .worker_step(self.worker_id, &story_id, step_id, step.kind.as_str());

        // (2) Compose the prompt from story context, prior notes, and both
        // scratch files.
        let global_scratch = scratch::read_global(&self.config.run_dir);
        let story_scratch = scratch::read_story(&self.config.run_dir, &story_id);
        let prompt = compose_step_prompt(&story, &step, &global_scratch, &story_scratch);

        // (3) Launch the agent, bounded by the kind's timeout.
        let log_path = self.config.step_log_path(&story_id, step_id);
        let timeout = step_timeout(step.kind);
        self.reporter.detail(&format!(
            "launching agent for {story_id}/{step_id} (timeout={}s)",
            timeout.as_secs()
        ));

        let outcome = launch_agent(
            self.config,
            &prompt,
            self.worker_id,
            &self.workdir,
            &log_path,
            timeout,
            self.reporter,
        )
        .await?;

        // (4) Record capture results on the step.
        if let Some(step) = story.find_step_mut(step_id) {
            step.log_file = Some(log_path.display().to_string());
            step.cost_usd = Some(outcome.cost_usd);
            step.input_tokens = Some(outcome.input_tokens);
            step.output_tokens = Some(outcome.output_tokens);
        }

        if outcome.timed_out {
            return self.finish_cancelled(story, step_id, &rev_at_start, timeout.as_secs());
        }
        if outcome.exit_code != 0 {
            return self.finish_failed(story, step_id, &rev_at_start, &outcome);
        }
        self.finish_completed(story, step_id, &rev_at_start, &outcome)
    }

    // -- success -------------------------------------------------------------

    fn finish_completed(
        &self,
        story: &mut Story,
        step_id: &str,
        rev_at_start: &str,
        outcome: &AgentOutcome,
    ) -> Result<StepStatus> {
        let story_id = story.id.clone();

        let summary = extract_summary(&outcome.final_response);
        if let (Some(summary), Some(step)) = (&summary, story.find_step(step_id)) {
            scratch::append_story(
                &self.config.run_dir,
                &story_id,
                &format!("\n### {} ({step_id})\n{summary}", step.kind),
            )?;
        }

        // (5) Consume any pending edit request before the completion write.
        // If the edit restarted this very step, the step goes back to
        // pending and the completion write is skipped.
        self.process_edit_request(story, step_id);

        let restarted = story
            .find_step(step_id)
            .is_some_and(|s| s.status == StepStatus::Pending);
        if restarted {
            // Same rollback as a failure: preserve the diff for debugging,
            // then reset to the pre-start revision for the re-invocation.
            let git = Git::new(&self.workdir);
            let diff_path = self.config.step_diff_path(&story_id, step_id);
            git.save_diff(rev_at_start, &diff_path)?;
            git.reset_hard(rev_at_start)?;

            self.persist_story(story)?;
            self.reporter.detail(&format!(
                "step {story_id}/{step_id} restarted (attempt {})",
                story
                    .find_step(step_id)
                    .map(|s| s.restart_count)
                    .unwrap_or_default()
            ));
            return Ok(StepStatus::Pending);
        }

        // (6) Completion write: notes, status, completion stamp — atomic
        // with the edit application above via one persist.
        if let Some(step) = story.find_step_mut(step_id) {
            step.notes = summary.or(step.notes.take()).or_else(|| {
                // notes must be non-null on completed steps; fall back to
                // the tail of the final response
                let tail = outcome.final_response.trim();
                (!tail.is_empty()).then(|| tail.to_string())
            });
            if step.notes.is_none() {
                step.notes = Some("(agent returned no summary)".to_string());
            }
            step.status = StepStatus::Completed;
            step.completed_at = Some(Utc::now());
        }
        story.push_history(
            HistoryEntry::new(
                HistoryAction::StepCompleted,
                Some(self.worker_id),
                Some(step_id),
            )
            .with_detail("cost_usd", outcome.cost_usd)
            .with_detail("num_turns", outcome.num_turns)
            .with_detail("input_tokens", outcome.input_tokens)
            .with_detail("output_tokens", outcome.output_tokens),
        );
        self.persist_story(story)?;

        self.reporter.detail(&format!(
            "step {story_id}/{step_id} completed (cost=${:.4}, turns={})",
            outcome.cost_usd, outcome.num_turns
        ));
        Ok(StepStatus::Completed)
    }

    // -- failure -------------------------------------------------------------

    fn finish_failed(
        &self,
        story: &mut Story,
        step_id: &str,
        rev_at_start: &str,
        outcome: &AgentOutcome,
    ) -> Result<StepStatus> {
        let story_id = story.id.clone();

        // Edits from failed steps are never applied.
        discard_edit_file(&self.config.edits_dir(), &story_id)?;

        let git = Git::new(&self.workdir);
        let diff_path = self.config.step_diff_path(&story_id, step_id);
        git.save_diff(rev_at_start, &diff_path)?;
        git.reset_hard(rev_at_start)?;

        let error = format!(
            "Agent exited with code {} (status={})",
            outcome.exit_code, outcome.completion_status
        );
        if let Some(step) = story.find_step_mut(step_id) {
            step.status = StepStatus::Failed;
            step.completed_at = Some(Utc::now());
            step.error = Some(error.clone());
        }
        story.push_history(
            HistoryEntry::new(
                HistoryAction::StepFailed,
                Some(self.worker_id),
                Some(step_id),
            )
            .with_detail("exit_code", outcome.exit_code)
            .with_detail("completion_status", outcome.completion_status.clone())
            .with_detail("cost_usd", outcome.cost_usd),
        );
        self.persist_story(story)?;

        scratch::append_global(
            &self.config.run_dir,
            &format!(
                "[{}] Story {story_id} step {step_id} FAILED: {error}",
                Utc::now().to_rfc3339()
            ),
        )?;
        self.reporter
            .detail(&format!("step {story_id}/{step_id} failed: {error}"));
        Ok(StepStatus::Failed)
    }

    // -- timeout -------------------------------------------------------------

    fn finish_cancelled(
        &self,
        story: &mut Story,
        step_id: &str,
        rev_at_start: &str,
        timeout_secs: u64,
    ) -> Result<StepStatus> {
        let story_id = story.id.clone();

        // A cancelled step never has its edit request applied.
        discard_edit_file(&self.config.edits_dir(), &story_id)?;

        let git = Git::new(&self.workdir);
        let diff_path = self.config.step_diff_path(&story_id, step_id);
        git.save_diff(rev_at_start, &diff_path)?;
        git.reset_hard(rev_at_start)?;

        if let Some(step) = story.find_step_mut(step_id) {
            step.status = StepStatus::Cancelled;
            step.completed_at = Some(Utc::now());
            step.error = Some(format!("Step timed out after {timeout_secs}s"));
        }
        story.push_history(
            HistoryEntry::new(
                HistoryAction::StepCancelled,
                Some(self.worker_id),
                Some(step_id),
            )
            .with_detail("reason", "timeout")
            .with_detail("timeout_seconds", timeout_secs),
        );
        self.persist_story(story)?;

        scratch::append_global(
            &self.config.run_dir,
            &format!(
                "[{}] Story {story_id} step {step_id} CANCELLED: timed out after {timeout_secs}s",
                Utc::now().to_rfc3339()
            ),
        )?;
        self.reporter.detail(&format!(
            "step {story_id}/{step_id} timed out after {timeout_secs}s"
        ));
        Ok(StepStatus::Cancelled)
    }

    // -- edit processing -----------------------------------------------------

    /// Parse, validate, and apply a pending edit request against the working
    /// copy. Rejections discard the file and write the reason to the story
    /// scratch so the next step sees it; the step itself still succeeds.
    fn process_edit_request(&self, story: &mut Story, step_id: &str) {
        let story_id = story.id.clone();
        let edits_dir = self.config.edits_dir();

        let operations = match parse_edit_file(&edits_dir, &story_id) {
            Ok(None) => return,
            Ok(Some(ops)) => ops,
            Err(err) => {
                self.reject_edit(&story_id, &err);
                return;
            }
        };

        if let Err(err) = validate_edits(story, &operations, self.worker_id) {
            self.reject_edit(&story_id, &err);
            return;
        }

        apply_edits(story, &operations, self.worker_id);
        self.reporter.detail(&format!(
            "applied {} workflow edit(s) for {story_id} from step {step_id}",
            operations.len()
        ));
        if let Err(e) = remove_edit_file(&edits_dir, &story_id) {
            self.reporter
                .detail(&format!("could not remove applied edit file: {e}"));
        }
    }

    fn reject_edit(&self, story_id: &str, err: &EditError) {
        self.reporter
            .detail(&format!("workflow edits for {story_id} rejected: {err}"));
        let _ = discard_edit_file(&self.config.edits_dir(), story_id);
        let _ = scratch::append_story(
            &self.config.run_dir,
            story_id,
            &format!("\n### Workflow edit rejected\n{err}"),
        );
    }

    // -- persistence ---------------------------------------------------------

    /// Sync the working copy's step list, history, and status fields into
    /// the persisted story under the state lock.
    fn persist_story(&self, story: &Story) -> Result<()> {
        let story_id = story.id.clone();
        let steps = story.steps.clone();
        let history = story.history.clone();
        self.store.with_locked(move |state| {
            if let Some(persisted) = state.stories.get_mut(&story_id) {
                persisted.steps = steps;
                persisted.history = history;
            }
        })?;
        Ok(())
    }
}
