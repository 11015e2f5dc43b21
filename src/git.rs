//! Git adapter for the orchestrator.
//!
//! The core issues a small, fixed set of git commands — revision capture,
//! diff snapshots, hard resets, and worktree/branch plumbing — so we keep an
//! explicit subprocess wrapper rather than an embedded library. Calls are
//! synchronous and expected-short; the state lock is never held across them.

use crate::errors::OrchestratorError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Current HEAD revision.
    pub fn head_rev(&self) -> Result<String, OrchestratorError> {
        let out = self
            .run_checked(&["rev-parse", "HEAD"])
            .map_err(|e| OrchestratorError::Git(e.to_string()))?;
        let rev = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if rev.is_empty() {
            return Err(OrchestratorError::Git(
                "git rev-parse HEAD returned empty output".to_string(),
            ));
        }
        Ok(rev)
    }

    /// Current branch name (e.g. `main`).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_checked(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if name.is_empty() {
            anyhow::bail!("could not determine current branch");
        }
        Ok(name)
    }

    /// Full working-tree diff since `base_rev`, untracked files included.
    ///
    /// `git diff <rev>` covers committed and tracked-uncommitted changes;
    /// untracked files are appended as `--no-index` diffs against /dev/null.
    pub fn diff_since(&self, base_rev: &str) -> Result<String> {
        let out = self.run(&["diff", base_rev])?;
        let mut diff = String::from_utf8_lossy(&out.stdout).to_string();

        for path in self.untracked_files()? {
            // --no-index exits 1 when the files differ; only a real spawn
            // failure is an error here.
            let out = self.run(&["diff", "--no-index", "--", "/dev/null", &path])?;
            diff.push_str(&String::from_utf8_lossy(&out.stdout));
        }
        Ok(diff)
    }

    /// Save the full working-tree diff since `base_rev` to `output_path`.
    pub fn save_diff(&self, base_rev: &str, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let diff = self.diff_since(base_rev)?;
        std::fs::write(output_path, diff)
            .with_context(|| format!("write diff to {}", output_path.display()))?;
        Ok(())
    }

    /// Hard-reset to `rev` and remove untracked files and directories.
    ///
    /// An empty rev is skipped: resetting to nothing would be destructive in
    /// a way the caller never intends.
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        if rev.is_empty() {
            return Ok(());
        }
        self.run_checked(&["reset", "--hard", rev])?;
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    fn untracked_files(&self) -> Result<Vec<String>> {
        let out = self.run_checked(&["status", "--porcelain=v1", "-uall"])?;
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(text
            .lines()
            .filter_map(|line| line.strip_prefix("?? "))
            .map(|p| p.trim().to_string())
            .collect())
    }

    // -- worktree / branch plumbing ------------------------------------------

    pub fn worktree_prune(&self) {
        let _ = self.run(&["worktree", "prune"]);
    }

    pub fn worktree_add(&self, path: &Path, branch: &str, base_branch: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["worktree", "add", &path_str, "-b", branch, base_branch])
            .with_context(|| format!("create worktree at {path_str}"))?;
        Ok(())
    }

    /// Attach a worktree to an existing branch.
    pub fn worktree_attach(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["worktree", "add", &path_str, branch])
            .with_context(|| format!("attach worktree at {path_str}"))?;
        Ok(())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> bool {
        self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])
        .map(|out| out.status.success())
        .unwrap_or(false)
    }

    /// Force-remove a worktree registration; ignores failure (the worktree
    /// may already be pruned).
    pub fn worktree_remove(&self, path: &Path) {
        let path_str = path.to_string_lossy().to_string();
        let _ = self.run(&["worktree", "remove", "--force", &path_str]);
    }

    /// Delete a local branch; ignores failure (it may not exist).
    pub fn branch_delete(&self, branch: &str) {
        let _ = self.run(&["branch", "-D", branch]);
    }

    /// Rebase the current branch onto `onto`; returns false (after aborting)
    /// when the rebase conflicts.
    pub fn rebase_onto(&self, onto: &str) -> Result<bool> {
        let out = self.run(&["rebase", onto])?;
        if out.status.success() {
            return Ok(true);
        }
        let _ = self.run(&["rebase", "--abort"]);
        Ok(false)
    }

    /// Squash-merge `branch` into the current branch; returns false (after
    /// resetting) on conflict.
    pub fn merge_squash(&self, branch: &str) -> Result<bool> {
        let out = self.run(&["merge", "--squash", branch])?;
        if out.status.success() {
            return Ok(true);
        }
        let _ = self.run(&["reset", "--hard", "HEAD"]);
        Ok(false)
    }

    /// Commit whatever is staged with `message`.
    pub fn commit(&self, message: &str) -> Result<()> {
        self.run_checked(&["commit", "-m", message])
            .context("commit squash merge")?;
        Ok(())
    }

    /// Read a config value; `None` when unset or git is unavailable.
    pub fn config_get(&self, key: &str) -> Option<String> {
        let out = self.run(&["config", key]).ok()?;
        if !out.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&out.stdout).trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let out = self.run(args)?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(out)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
