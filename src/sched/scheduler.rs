//! Multi-story scheduler.
//!
//! Validates the dependency DAG at startup, reconciles orphaned state left
//! by a crashed orchestrator, then drives the main loop: claim assignable
//! stories into worker slots, run each in an isolated worktree, integrate
//! completed work back into the base, and propagate failures to dependents.
//!
//! The orchestrator is the single writer of the state document; worker
//! tasks run in-process and route every mutation through the store's lock.

use crate::config::Config;
use crate::exec::runner::StoryRunner;
use crate::manifest::{load_stories, ManifestStory};
use crate::progress::Reporter;
use crate::sched::graph::StoryGraph;
use crate::sched::workspace::{IntegrationOutcome, WorkspaceManager};
use crate::state::store::{
    block_dependents, find_assignable_story, reevaluate_blocked, StateStore,
};
use crate::workflow::model::{
    HistoryAction, HistoryEntry, Step, StepKind, StepStatus, Story, StoryStatus,
};
use crate::workflow::steps::{default_workflow, MAX_STEPS_PER_STORY};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;

/// What a finished worker task reports back to the main loop.
struct SlotResult {
    worker_id: u32,
    story_id: String,
    success: bool,
    error: Option<String>,
}

pub struct Scheduler {
    config: Arc<Config>,
    store: StateStore,
    workspaces: WorkspaceManager,
}

impl Scheduler {
    pub fn new(config: Config) -> Result<Self> {
        let store = StateStore::new(config.state_path());
        let workspaces = WorkspaceManager::new(&config.project_dir)?;
        Ok(Self {
            config: Arc::new(config),
            store,
            workspaces,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Parse the manifest, validate the dependency graph, and create the
    /// initial state document.
    ///
    /// With `resume`, an existing state document is reused as-is (the graph
    /// is still re-validated). Cycles abort before any state reaches disk.
    pub fn initialize(&self, manifest_path: &Path, resume: bool) -> Result<()> {
        if self.store.exists() && resume {
            let state = self.store.load()?;
            let pairs: Vec<(String, Vec<String>)> = state
                .stories
                .values()
                .map(|s| (s.id.clone(), s.depends_on.clone()))
                .collect();
            StoryGraph::build(&pairs).context("dependency validation on resume")?;
            return Ok(());
        }

        let stories = load_stories(manifest_path)?;
        let pairs: Vec<(String, Vec<String>)> = stories
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.clone()))
            .collect();
        StoryGraph::build(&pairs).context("dependency validation")?;

        let records: Vec<Story> = stories.into_iter().map(story_from_manifest).collect();
        self.store
            .initialize(records, &manifest_path.display().to_string())?;
        Ok(())
    }

    /// Startup pass: fail the in-progress step of any story whose worker is
    /// gone, salvage uncommitted work, and reset the workspace.
    ///
    /// All worker tasks are in-process, so at startup every in_progress
    /// story is orphaned by definition. The story itself stays in_progress;
    /// its re-run surfaces the failure. Running the pass twice produces the
    /// same state as running it once.
    pub fn reconcile(&self, reporter: &Reporter) -> Result<()> {
        let state = self.store.load()?;

        for story in state.stories.values() {
            if story.status != StoryStatus::InProgress {
                continue;
            }
            let Some(step) = story
                .steps
                .iter()
                .find(|s| s.status == StepStatus::InProgress)
            else {
                continue;
            };
            let story_id = story.id.clone();
            let step_id = step.id.clone();
            let rev = step.rev_at_start.clone().unwrap_or_default();

            reporter.announce(&format!(
                "Reconciliation: step {story_id}/{step_id} was in progress with no live worker"
            ));

            // Salvage whatever the dead agent left behind, then reset.
            let workdir = story
                .worker_id
                .map(|w| self.workspaces.worktree_path(w))
                .filter(|p| p.exists())
                .unwrap_or_else(|| self.config.project_dir.clone());
            if !rev.is_empty() {
                let diff_path = self.config.reconcile_diff_path(&story_id, &step_id);
                if let Err(e) = self
                    .workspaces
                    .salvage_and_reset(&workdir, &rev, &diff_path)
                {
                    reporter.detail(&format!(
                        "reconciliation: workspace reset for {story_id} failed: {e}"
                    ));
                }
            }

            self.store.with_locked({
                let story_id = story_id.clone();
                let step_id = step_id.clone();
                move |state| {
                    if let Some(story) = state.stories.get_mut(&story_id) {
                        if let Some(step) = story.find_step_mut(&step_id) {
                            if step.status == StepStatus::InProgress {
                                step.status = StepStatus::Failed;
                                step.completed_at = Some(Utc::now());
                                step.error = Some(
                                    "Reconciliation: orchestrator restarted while this step was in progress"
                                        .to_string(),
                                );
                            }
                        }
                        story.push_history(
                            HistoryEntry::new(HistoryAction::StepFailed, None, Some(&step_id))
                                .with_detail("reason", "reconciliation"),
                        );
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Main loop: assign, wait, integrate, propagate; runs until every
    /// story is terminal or permanently blocked.
    pub async fn run(&self, workers: usize, reporter: Arc<Reporter>) -> Result<()> {
        let mut free_slots: Vec<u32> = (1..=workers as u32).rev().collect();
        let mut active: HashMap<u32, String> = HashMap::new();
        let mut tasks: JoinSet<SlotResult> = JoinSet::new();
        // Consecutive runner errors per story; a story that keeps erroring
        // (e.g. persistent lock timeouts) is failed instead of retried
        // forever.
        let mut error_counts: HashMap<String, u32> = HashMap::new();
        const MAX_RUNNER_ERRORS: u32 = 3;

        loop {
            self.store.with_locked(reevaluate_blocked)?;

            // Fill free slots with assignable or orphaned stories.
            while let Some(&slot) = free_slots.last() {
                let Some((story_id, title, resumed)) = self.claim_next(slot, active.values())?
                else {
                    break;
                };
                free_slots.pop();

                reporter.worker_started(slot, &story_id, &title);
                let workdir = if resumed {
                    self.workspaces.create_or_attach(slot, &story_id)?
                } else {
                    self.workspaces.create(slot, &story_id)?
                };

                active.insert(slot, story_id.clone());
                let config = Arc::clone(&self.config);
                let store = self.store.clone();
                let task_reporter = Arc::clone(&reporter);
                tasks.spawn(async move {
                    let runner = StoryRunner::new(&config, &store, &task_reporter, workdir, slot);
                    match runner.run(&story_id).await {
                        Ok(success) => SlotResult {
                            worker_id: slot,
                            story_id,
                            success,
                            error: None,
                        },
                        Err(e) => SlotResult {
                            worker_id: slot,
                            story_id,
                            success: false,
                            error: Some(e.to_string()),
                        },
                    }
                });
            }

            if active.is_empty() {
                self.finish_run(&reporter)?;
                break;
            }

            // Wait for any slot to finish a story.
            let Some(joined) = tasks.join_next().await else {
                continue;
            };
            let result = match joined {
                Ok(result) => result,
                Err(join_err) => {
                    // A panicked worker task; the state document is still
                    // consistent, so surface and stop.
                    return Err(anyhow::anyhow!("worker task panicked: {join_err}"));
                }
            };

            active.remove(&result.worker_id);
            if let Some(error) = &result.error {
                reporter.announce(&format!(
                    "  worker {} error on [{}]: {error}",
                    result.worker_id, result.story_id
                ));
                // The story may still be in_progress; it gets retried next
                // iteration unless it has already exhausted its attempts.
                let count = error_counts.entry(result.story_id.clone()).or_default();
                *count += 1;
                if *count >= MAX_RUNNER_ERRORS {
                    reporter.announce(&format!(
                        "  story [{}] failed after {MAX_RUNNER_ERRORS} runner errors",
                        result.story_id
                    ));
                    self.mark_story_failed_with_reason(
                        &result.story_id,
                        "repeated orchestrator errors",
                    )?;
                }
            } else {
                error_counts.remove(&result.story_id);
            }

            if result.success {
                let slot_freed = self
                    .handle_story_success(result.worker_id, &result.story_id, &reporter, &mut active)
                    .await?;
                if slot_freed {
                    free_slots.push(result.worker_id);
                    free_slots.sort_unstable_by(|a, b| b.cmp(a));
                }
            } else {
                self.handle_story_failure(result.worker_id, &result.story_id, &reporter)?;
                free_slots.push(result.worker_id);
                free_slots.sort_unstable_by(|a, b| b.cmp(a));
            }

            self.print_status(&reporter)?;
        }
        Ok(())
    }

    /// Claim the next runnable story for a worker slot under the lock.
    ///
    /// Prefers orphaned in_progress stories (left by a previous orchestrator
    /// process) over fresh assignments so reconciled state drains first.
    /// Returns `(story_id, title, resumed)`.
    fn claim_next<'i>(
        &self,
        slot: u32,
        running: impl Iterator<Item = &'i String>,
    ) -> Result<Option<(String, String, bool)>> {
        let running: Vec<String> = running.cloned().collect();
        let claimed = self.store.with_locked(move |state| {
            let orphan = state
                .stories
                .values()
                .find(|s| s.status == StoryStatus::InProgress && !running.contains(&s.id))
                .map(|s| s.id.clone());

            if let Some(story_id) = orphan {
                if let Some(story) = state.stories.get_mut(&story_id) {
                    story.worker_id = Some(slot);
                    return Some((story.id.clone(), story.title.clone(), true));
                }
            }

            let story_id = find_assignable_story(state)?;
            let story = state.stories.get_mut(&story_id)?;
            story.status = StoryStatus::InProgress;
            story.worker_id = Some(slot);
            story.claimed_at = Some(Utc::now());
            if story.steps.is_empty() {
                story.steps = default_workflow();
            }
            story.push_history(HistoryEntry::new(
                HistoryAction::StoryClaimed,
                Some(slot),
                None,
            ));
            Some((story.id.clone(), story.title.clone(), false))
        })?;
        Ok(claimed)
    }

    /// Integrate a finished story; on conflict, schedule a resolution step
    /// and re-run the story in the same worktree until it merges or fails.
    ///
    /// Returns true when the worker slot is free again.
    async fn handle_story_success(
        &self,
        worker_id: u32,
        story_id: &str,
        reporter: &Arc<Reporter>,
        active: &mut HashMap<u32, String>,
    ) -> Result<bool> {
        loop {
            match self.workspaces.integrate(worker_id, story_id)? {
                IntegrationOutcome::Merged => {
                    let workdir = self.workspaces.worktree_path(worker_id);
                    let runner =
                        StoryRunner::new(&self.config, &self.store, reporter, workdir, worker_id);
                    runner.complete(story_id)?;
                    self.workspaces.remove(worker_id);
                    self.workspaces.delete_branch(story_id);
                    reporter.worker_finished(worker_id, story_id, true);
                    return Ok(true);
                }
                IntegrationOutcome::Conflict => {
                    reporter.announce(&format!(
                        "  integration conflict on [{story_id}]; scheduling resolution step"
                    ));
                    if !self.schedule_conflict_resolution(story_id)? {
                        // Step cap reached; the story cannot absorb another
                        // resolution round.
                        self.mark_story_failed_with_reason(
                            story_id,
                            &format!("step cap of {MAX_STEPS_PER_STORY} reached"),
                        )?;
                        self.handle_story_failure(worker_id, story_id, reporter)?;
                        return Ok(true);
                    }

                    let workdir = self.workspaces.worktree_path(worker_id);
                    let runner =
                        StoryRunner::new(&self.config, &self.store, reporter, workdir, worker_id);
                    active.insert(worker_id, story_id.to_string());
                    let success = runner.run(story_id).await?;
                    active.remove(&worker_id);
                    if !success {
                        self.handle_story_failure(worker_id, story_id, reporter)?;
                        return Ok(true);
                    }
                    // resolved; retry integration
                }
            }
        }
    }

    fn handle_story_failure(
        &self,
        worker_id: u32,
        story_id: &str,
        reporter: &Arc<Reporter>,
    ) -> Result<()> {
        self.store.with_locked({
            let story_id = story_id.to_string();
            move |state| block_dependents(state, &story_id)
        })?;
        self.workspaces.remove(worker_id);
        self.workspaces.delete_branch(story_id);
        reporter.worker_finished(worker_id, story_id, false);
        Ok(())
    }

    /// Insert a conflict-resolution coding step immediately before
    /// final_review and reset final_review so it re-runs after resolution.
    ///
    /// Returns false when the 30-step cap leaves no room.
    fn schedule_conflict_resolution(&self, story_id: &str) -> Result<bool> {
        let base_branch = self.workspaces.base_branch().to_string();
        let inserted = self.store.with_locked({
            let story_id = story_id.to_string();
            move |state| {
                let Some(story) = state.stories.get_mut(&story_id) else {
                    return false;
                };
                if story.steps.len() >= MAX_STEPS_PER_STORY {
                    return false;
                }
                let Some(fr_idx) = story
                    .steps
                    .iter()
                    .rposition(|s| s.kind == StepKind::FinalReview)
                else {
                    return false;
                };

                let step_id = story.next_step_id();
                let description = format!(
                    "Rebase this branch onto '{base_branch}' and resolve the merge conflicts, \
                     preserving the intent of both sides; commit the result"
                );
                story
                    .steps
                    .insert(fr_idx, Step::new(&step_id, StepKind::Coding, description));

                // final_review re-runs after resolution
                let fr = &mut story.steps[fr_idx + 1];
                fr.status = StepStatus::Pending;
                fr.started_at = None;
                fr.completed_at = None;
                fr.notes = None;
                fr.error = None;

                // re-open the story for the resolution round
                story.status = StoryStatus::InProgress;
                story.completed_at = None;
                story.push_history(
                    HistoryEntry::new(HistoryAction::WorkflowEdit, None, Some(&step_id))
                        .with_detail("operation", "conflict_resolution")
                        .with_detail("base_branch", base_branch.clone()),
                );
                true
            }
        })?;
        Ok(inserted)
    }

    fn mark_story_failed_with_reason(&self, story_id: &str, reason: &str) -> Result<()> {
        self.store.with_locked({
            let story_id = story_id.to_string();
            let reason = reason.to_string();
            move |state| {
                if let Some(story) = state.stories.get_mut(&story_id) {
                    story.status = StoryStatus::Failed;
                    story.completed_at = Some(Utc::now());
                    story.push_history(
                        HistoryEntry::new(HistoryAction::StoryFailed, None, None)
                            .with_detail("reason", reason.clone()),
                    );
                }
            }
        })?;
        Ok(())
    }

    fn print_status(&self, reporter: &Reporter) -> Result<()> {
        let state = self.store.load()?;
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for story in state.stories.values() {
            *counts.entry(status_name(story.status)).or_default() += 1;
        }
        let mut pairs: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        pairs.sort();
        reporter.status_summary(&pairs, state.stories.len());
        Ok(())
    }

    /// Final bookkeeping when no story is runnable and no worker is active.
    fn finish_run(&self, reporter: &Reporter) -> Result<()> {
        let all_terminal = self.store.with_locked(|state| {
            let remaining = state
                .stories
                .values()
                .filter(|s| {
                    matches!(s.status, StoryStatus::Unclaimed | StoryStatus::InProgress)
                })
                .count();
            if remaining == 0 {
                state.finished_at = Some(Utc::now());
            }
            remaining == 0
        })?;

        if all_terminal {
            reporter.announce("All stories finished.");
        } else {
            reporter.announce("No assignable stories remain; some are blocked by dependencies.");
        }
        Ok(())
    }
}

fn story_from_manifest(entry: ManifestStory) -> Story {
    let mut story = Story::new(&entry.id, &entry.title);
    story.description = entry.description;
    story.acceptance_criteria = entry.acceptance_criteria;
    story.depends_on = entry.depends_on;
    // Stories the manifest author pre-marked as passing are recorded as
    // completed so dependents are not held up on them.
    if entry.passes == Some(true) {
        story.status = StoryStatus::Completed;
        story.completed_at = Some(Utc::now());
    }
    story
}

fn status_name(status: StoryStatus) -> &'static str {
    match status {
        StoryStatus::Unclaimed => "unclaimed",
        StoryStatus::InProgress => "in_progress",
        StoryStatus::Completed => "completed",
        StoryStatus::Failed => "failed",
        StoryStatus::Blocked => "blocked",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.name", "test"],
            vec!["config", "user.email", "t@t.dev"],
        ] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
        }
        std::fs::write(dir.join("base.txt"), "base\n").unwrap();
        for args in [vec!["add", "-A"], vec!["commit", "-m", "init"]] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
        }
    }

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, Scheduler, Arc<Reporter>) {
        let project = tempdir().unwrap();
        let run = tempdir().unwrap();
        init_repo(project.path());
        let config = Config::new(
            project.path().to_path_buf(),
            run.path().to_path_buf(),
            false,
        )
        .unwrap();
        let reporter = Arc::new(Reporter::new(0, config.summary_log_path(), false));
        let scheduler = Scheduler::new(config).unwrap();
        (project, run, scheduler, reporter)
    }

    fn write_manifest(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("prd.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_initialize_rejects_cycle_before_writing_state() {
        let (project, _run, scheduler, _reporter) = setup();
        let manifest = write_manifest(
            project.path(),
            r#"[{"id": "A", "title": "a", "depends_on": ["B"]},
                {"id": "B", "title": "b", "depends_on": ["A"]}]"#,
        );

        let err = scheduler.initialize(&manifest, false).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("Circular dependency"));
        assert!(msg.contains('A') && msg.contains('B'));
        assert!(!scheduler.store().exists());
    }

    #[test]
    fn test_initialize_creates_state_with_unclaimed_stories() {
        let (project, _run, scheduler, _reporter) = setup();
        let manifest = write_manifest(
            project.path(),
            r#"[{"id": "US-001", "title": "First", "acceptanceCriteria": ["ok"]},
                {"id": "US-002", "title": "Second", "depends_on": ["US-001"]}]"#,
        );

        scheduler.initialize(&manifest, false).unwrap();
        let state = scheduler.store().load().unwrap();
        assert_eq!(state.stories.len(), 2);
        assert!(state
            .stories
            .values()
            .all(|s| s.status == StoryStatus::Unclaimed));
        assert!(state.stories.values().all(|s| s.steps.is_empty()));
    }

    #[test]
    fn test_initialize_marks_passing_stories_completed() {
        let (project, _run, scheduler, _reporter) = setup();
        let manifest = write_manifest(
            project.path(),
            r#"[{"id": "US-001", "title": "Done already", "passes": true},
                {"id": "US-002", "title": "Real work", "depends_on": ["US-001"]}]"#,
        );

        scheduler.initialize(&manifest, false).unwrap();
        let state = scheduler.store().load().unwrap();
        assert_eq!(state.stories["US-001"].status, StoryStatus::Completed);
        assert_eq!(
            find_assignable_story(&state).as_deref(),
            Some("US-002")
        );
    }

    #[test]
    fn test_resume_keeps_existing_state() {
        let (project, _run, scheduler, _reporter) = setup();
        let manifest = write_manifest(
            project.path(),
            r#"[{"id": "US-001", "title": "First"}]"#,
        );
        scheduler.initialize(&manifest, false).unwrap();
        scheduler
            .store()
            .with_locked(|state| {
                state.stories.get_mut("US-001").unwrap().status = StoryStatus::Completed;
            })
            .unwrap();

        scheduler.initialize(&manifest, true).unwrap();
        let state = scheduler.store().load().unwrap();
        assert_eq!(state.stories["US-001"].status, StoryStatus::Completed);
    }

    #[test]
    fn test_reconcile_fails_orphaned_step_and_is_idempotent() {
        let (project, _run, scheduler, reporter) = setup();
        let manifest = write_manifest(
            project.path(),
            r#"[{"id": "US-001", "title": "Orphan"}]"#,
        );
        scheduler.initialize(&manifest, false).unwrap();

        let rev = crate::git::Git::new(project.path()).head_rev().unwrap();
        scheduler
            .store()
            .with_locked({
                let rev = rev.clone();
                move |state| {
                    let story = state.stories.get_mut("US-001").unwrap();
                    story.status = StoryStatus::InProgress;
                    story.worker_id = Some(1);
                    story.steps = default_workflow();
                    let step = story.find_step_mut("step-003").unwrap();
                    step.status = StepStatus::InProgress;
                    step.rev_at_start = Some(rev);
                    for id in ["step-001", "step-002"] {
                        let step = story.find_step_mut(id).unwrap();
                        step.status = StepStatus::Completed;
                        step.notes = Some("done".into());
                    }
                }
            })
            .unwrap();
        // uncommitted work the dead agent left behind
        std::fs::write(project.path().join("base.txt"), "dangling\n").unwrap();

        scheduler.reconcile(&reporter).unwrap();

        let state = scheduler.store().load().unwrap();
        let story = &state.stories["US-001"];
        assert_eq!(story.status, StoryStatus::InProgress);
        let step = story.find_step("step-003").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.as_deref().unwrap().contains("Reconciliation"));
        // workspace reset, diff preserved
        assert_eq!(
            std::fs::read_to_string(project.path().join("base.txt")).unwrap(),
            "base\n"
        );
        let diff_path = scheduler
            .config
            .reconcile_diff_path("US-001", "step-003");
        assert!(diff_path.exists());
        assert!(std::fs::read_to_string(&diff_path)
            .unwrap()
            .contains("+dangling"));

        // second pass: same final state
        let before = std::fs::read_to_string(scheduler.store().state_path()).unwrap();
        scheduler.reconcile(&reporter).unwrap();
        let after = std::fs::read_to_string(scheduler.store().state_path()).unwrap();
        let strip_history = |s: &str| {
            let v: serde_json::Value = serde_json::from_str(s).unwrap();
            v["stories"]["US-001"]["steps"].clone()
        };
        assert_eq!(strip_history(&before), strip_history(&after));
    }

    #[test]
    fn test_schedule_conflict_resolution_inserts_before_final_review() {
        let (project, _run, scheduler, _reporter) = setup();
        let manifest = write_manifest(
            project.path(),
            r#"[{"id": "US-001", "title": "Conflicted"}]"#,
        );
        scheduler.initialize(&manifest, false).unwrap();
        scheduler
            .store()
            .with_locked(|state| {
                let story = state.stories.get_mut("US-001").unwrap();
                story.status = StoryStatus::InProgress;
                story.worker_id = Some(1);
                story.steps = default_workflow();
                for step in &mut story.steps {
                    step.status = StepStatus::Completed;
                    step.notes = Some("done".into());
                }
            })
            .unwrap();

        assert!(scheduler.schedule_conflict_resolution("US-001").unwrap());

        let state = scheduler.store().load().unwrap();
        let story = &state.stories["US-001"];
        assert_eq!(story.steps.len(), 11);
        let resolution = story.find_step("step-011").unwrap();
        assert_eq!(resolution.kind, StepKind::Coding);
        assert_eq!(resolution.status, StepStatus::Pending);
        assert!(resolution.description.contains("main"));
        // resolution sits immediately before final_review, which re-runs
        let last = story.steps.last().unwrap();
        assert_eq!(last.kind, StepKind::FinalReview);
        assert_eq!(last.status, StepStatus::Pending);
        assert_eq!(story.steps[story.steps.len() - 2].id, "step-011");
        assert_eq!(story.status, StoryStatus::InProgress);
    }

    #[test]
    fn test_schedule_conflict_resolution_respects_step_cap() {
        let (project, _run, scheduler, _reporter) = setup();
        let manifest = write_manifest(
            project.path(),
            r#"[{"id": "US-001", "title": "Too many"}]"#,
        );
        scheduler.initialize(&manifest, false).unwrap();
        scheduler
            .store()
            .with_locked(|state| {
                let story = state.stories.get_mut("US-001").unwrap();
                story.steps = default_workflow();
                for i in 11..=30 {
                    story.steps.insert(
                        story.steps.len() - 1,
                        Step::new(format!("step-{i:03}"), StepKind::Coding, "filler"),
                    );
                }
                assert_eq!(story.steps.len(), 30);
            })
            .unwrap();

        assert!(!scheduler.schedule_conflict_resolution("US-001").unwrap());
    }

    #[tokio::test]
    async fn test_run_loop_terminates_with_blocked_stories() {
        let (project, _run, scheduler, reporter) = setup();
        let manifest = write_manifest(
            project.path(),
            r#"[{"id": "A", "title": "failed earlier"},
                {"id": "B", "title": "waits on A", "depends_on": ["A"]}]"#,
        );
        scheduler.initialize(&manifest, false).unwrap();
        scheduler
            .store()
            .with_locked(|state| {
                state.stories.get_mut("A").unwrap().status = StoryStatus::Failed;
                block_dependents(state, "A");
            })
            .unwrap();

        // nothing assignable, nothing active: the loop exits immediately
        scheduler.run(2, Arc::clone(&reporter)).await.unwrap();

        let state = scheduler.store().load().unwrap();
        assert_eq!(state.stories["B"].status, StoryStatus::Blocked);
        // blocked is a terminal outcome for the run; the loop drains and
        // stamps finished_at
        assert!(state.finished_at.is_some());
    }
}
