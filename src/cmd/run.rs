//! Orchestrator entry points: one-shot and manifest modes.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use weaver::config::{generate_run_dir, write_metadata, Config};
use weaver::docker::{build_image, image_exists};
use weaver::exec::runner::StoryRunner;
use weaver::progress::Reporter;
use weaver::sched::scheduler::Scheduler;
use weaver::state::store::StateStore;
use weaver::workflow::model::{HistoryAction, HistoryEntry, Story, StoryStatus};
use weaver::workflow::steps::default_workflow;

use super::super::Cli;

/// Resolve the run directory: explicit `--run-dir` or a generated
/// `runs/<timestamp>_<id>/` under the project.
fn resolve_run_dir(cli: &Cli, project_dir: &PathBuf) -> Result<PathBuf> {
    match &cli.run_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create run directory {}", dir.display()))?;
            Ok(dir.clone())
        }
        None => generate_run_dir(project_dir),
    }
}

fn build_config(cli: &Cli) -> Result<Config> {
    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or(std::env::current_dir().context("determine working directory")?);
    let run_dir = resolve_run_dir(cli, &project_dir)?;
    let config = Config::new(project_dir, run_dir, cli.verbose)?;
    write_metadata(&config)?;
    Ok(config)
}

/// Run a single free-form task through the full step workflow, in place
/// (no worktree, no integration).
pub async fn run_one_shot(cli: &Cli, task: &str) -> Result<i32> {
    let config = build_config(cli)?;
    maybe_build_image(cli, &config)?;

    let store = StateStore::new(config.state_path());
    let mut story = Story::new("oneshot", task.chars().take(80).collect::<String>());
    story.description = task.to_string();
    story.status = StoryStatus::InProgress;
    story.worker_id = Some(1);
    story.claimed_at = Some(chrono::Utc::now());
    story.steps = default_workflow();
    story.push_history(HistoryEntry::new(HistoryAction::StoryClaimed, Some(1), None));
    store.initialize(vec![story], "")?;

    let reporter = Reporter::new(1, config.summary_log_path(), cli.verbose);
    reporter.announce(&format!(
        "One-shot mode: executing task with 10 steps (state: {})",
        config.state_path().display()
    ));

    let runner = StoryRunner::new(
        &config,
        &store,
        &reporter,
        config.project_dir.clone(),
        1,
    );
    let success = runner.run("oneshot").await?;
    if success {
        runner.complete("oneshot")?;
        reporter.announce("One-shot task completed successfully.");
    } else {
        reporter.announce("One-shot task FAILED.");
    }
    reporter.finish();
    Ok(if success { 0 } else { 1 })
}

/// Run stories from a manifest with up to `workers` concurrent agents.
pub async fn run_manifest(cli: &Cli, manifest: &PathBuf) -> Result<i32> {
    if !manifest.exists() {
        anyhow::bail!("manifest file not found: {}", manifest.display());
    }
    let config = build_config(cli)?;
    maybe_build_image(cli, &config)?;

    // Keep a copy of the manifest next to the state for post-run analysis.
    let _ = std::fs::copy(manifest, config.run_dir.join("manifest.json"));

    let scheduler = Scheduler::new(config.clone())?;
    scheduler.initialize(manifest, cli.resume)?;

    let total = scheduler.store().load()?.stories.len() as u64;
    let reporter = Arc::new(Reporter::new(
        total,
        config.summary_log_path(),
        cli.verbose,
    ));
    reporter.announce(&format!(
        "Run directory: {} ({} workers)",
        config.run_dir.display(),
        cli.workers
    ));

    scheduler.reconcile(&reporter)?;
    scheduler.run(cli.workers.max(1), Arc::clone(&reporter)).await?;
    reporter.finish();
    Ok(0)
}

fn maybe_build_image(cli: &Cli, config: &Config) -> Result<()> {
    if config.no_docker {
        return Ok(());
    }
    if cli.build || !image_exists(&config.image) {
        build_image(config)?;
    }
    Ok(())
}
