//! Runtime configuration for the Weaver orchestrator.
//!
//! Bridges the environment contract (`WEAVER_*` variables, all with
//! documented defaults) with the run-directory layout every worker shares:
//! the state document, scratch files, edit drop box, and log tree.

use crate::git::Git;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Name of the edit drop-box directory under the run root.
pub const EDITS_DIR_NAME: &str = "edits";
/// Name of the log tree under the run root.
pub const LOGS_DIR_NAME: &str = "logs";
/// Name of the state document under the run root.
pub const STATE_FILE_NAME: &str = "state.json";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Runtime configuration shared by the scheduler, executor, and workspace
/// layer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Repository the agents work against
    pub project_dir: PathBuf,
    /// Shared root for state, scratch, edits, and logs
    pub run_dir: PathBuf,
    /// Agent CLI invocation, whitespace-separated (`WEAVER_AGENT_CMD`)
    pub agent_cmd: String,
    /// Container image for sandboxed agents (`WEAVER_IMAGE`)
    pub image: String,
    /// Compose file for test infrastructure (`WEAVER_COMPOSE_FILE`)
    pub compose_file: String,
    /// Env file passed to compose (`WEAVER_ENV_FILE`)
    pub env_file: String,
    /// Main service name (`WEAVER_SERVICE`)
    pub service: String,
    /// Comma-separated infra services (`WEAVER_INFRA_SERVICES`)
    pub infra_services: Vec<String>,
    /// Dockerfile used when building the agent image (`WEAVER_DOCKERFILE`)
    pub dockerfile: String,
    /// Git author identity applied inside agent containers
    pub git_author_name: String,
    pub git_author_email: String,
    /// Skip the docker wrapper and run the agent directly
    /// (`WEAVER_NO_DOCKER`, set automatically inside containers)
    pub no_docker: bool,
    pub verbose: bool,
}

impl Config {
    /// Assemble configuration from the environment contract.
    ///
    /// `run_dir` is created if missing, along with the edit drop box and log
    /// tree.
    pub fn new(project_dir: PathBuf, run_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("resolve project directory")?;

        let (git_author_name, git_author_email) = resolve_git_identity(&project_dir);

        let no_docker = std::env::var("WEAVER_NO_DOCKER")
            .map(|v| v != "0" && !v.is_empty())
            .unwrap_or(false)
            || Path::new("/.dockerenv").exists();

        let config = Self {
            project_dir,
            run_dir,
            agent_cmd: env_or("WEAVER_AGENT_CMD", "npx @anthropic-ai/claude-code"),
            image: env_or("WEAVER_IMAGE", "weaver-agent:latest"),
            compose_file: env_or("WEAVER_COMPOSE_FILE", "compose.test.yml"),
            env_file: env_or("WEAVER_ENV_FILE", ".env"),
            service: env_or("WEAVER_SERVICE", "app"),
            infra_services: env_or("WEAVER_INFRA_SERVICES", "mysql,redis")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            dockerfile: env_or("WEAVER_DOCKERFILE", "docker/Dockerfile"),
            git_author_name,
            git_author_email,
            no_docker,
            verbose,
        };
        config.ensure_directories()?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.edits_dir()).context("create edit drop box")?;
        std::fs::create_dir_all(self.logs_dir()).context("create log tree")?;
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.run_dir.join(STATE_FILE_NAME)
    }

    pub fn edits_dir(&self) -> PathBuf {
        self.run_dir.join(EDITS_DIR_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir.join(LOGS_DIR_NAME)
    }

    /// Event-stream log path for one step, keyed by story and step ID.
    pub fn step_log_path(&self, story_id: &str, step_id: &str) -> PathBuf {
        self.logs_dir().join(story_id).join(format!("{step_id}.jsonl"))
    }

    /// Diagnostic diff path for a failed or restarted step.
    pub fn step_diff_path(&self, story_id: &str, step_id: &str) -> PathBuf {
        self.logs_dir().join(story_id).join(format!("{step_id}.diff"))
    }

    /// Diagnostic diff path written during startup reconciliation.
    pub fn reconcile_diff_path(&self, story_id: &str, step_id: &str) -> PathBuf {
        self.logs_dir()
            .join(story_id)
            .join(format!("{step_id}.reconcile.diff"))
    }

    pub fn summary_log_path(&self) -> PathBuf {
        self.run_dir.join("summary.log")
    }
}

/// Resolve the git author identity for agent containers.
///
/// Priority, for name and email independently: `WEAVER_GIT_AUTHOR_NAME` /
/// `WEAVER_GIT_AUTHOR_EMAIL`, then host `git config`, then a fallback with a
/// warning.
fn resolve_git_identity(project_dir: &Path) -> (String, String) {
    let git = Git::new(project_dir);

    let name = std::env::var("WEAVER_GIT_AUTHOR_NAME")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| git.config_get("user.name"))
        .unwrap_or_else(|| {
            eprintln!(
                "Warning: git author name not configured. \
                 Set WEAVER_GIT_AUTHOR_NAME or run `git config user.name`."
            );
            "Weaver Agent".to_string()
        });

    let email = std::env::var("WEAVER_GIT_AUTHOR_EMAIL")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| git.config_get("user.email"))
        .unwrap_or_else(|| {
            eprintln!(
                "Warning: git author email not configured. \
                 Set WEAVER_GIT_AUTHOR_EMAIL or run `git config user.email`."
            );
            "weaver-agent@weaver.dev".to_string()
        });

    (name, email)
}

/// Create a unique run directory: `runs/<YYYYMMDD>T<HHMMSS>_<8-hex>/`.
pub fn generate_run_dir(base: &Path) -> Result<PathBuf> {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S");
    let unique = &uuid::Uuid::new_v4().simple().to_string()[..8];
    let run_dir = base.join("runs").join(format!("{timestamp}_{unique}"));
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("create run directory {}", run_dir.display()))?;
    Ok(run_dir)
}

/// Write `metadata.json` with environment info for post-run analysis.
pub fn write_metadata(config: &Config) -> Result<()> {
    let git = Git::new(&config.project_dir);
    let weaver_env: serde_json::Map<String, serde_json::Value> = std::env::vars()
        .filter(|(k, _)| k.starts_with("WEAVER_"))
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();

    let metadata = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "project_dir": config.project_dir.display().to_string(),
        "git_branch": git.current_branch().unwrap_or_default(),
        "git_rev": git.head_rev().unwrap_or_default(),
        "image": config.image,
        "weaver_env": weaver_env,
    });

    let path = config.run_dir.join("metadata.json");
    let mut text = serde_json::to_string_pretty(&metadata)?;
    text.push('\n');
    std::fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(project: &Path, run: &Path) -> Config {
        Config::new(project.to_path_buf(), run.to_path_buf(), false).unwrap()
    }

    #[test]
    fn test_layout_paths() {
        let project = tempdir().unwrap();
        let run = tempdir().unwrap();
        let config = test_config(project.path(), run.path());

        assert_eq!(config.state_path(), run.path().join("state.json"));
        assert_eq!(
            config.step_log_path("US-001", "step-005"),
            run.path().join("logs/US-001/step-005.jsonl")
        );
        assert_eq!(
            config.step_diff_path("US-001", "step-005"),
            run.path().join("logs/US-001/step-005.diff")
        );
        assert!(config.edits_dir().exists());
        assert!(config.logs_dir().exists());
    }

    #[test]
    fn test_defaults_from_environment_contract() {
        let project = tempdir().unwrap();
        let run = tempdir().unwrap();
        let config = test_config(project.path(), run.path());

        assert_eq!(config.image, "weaver-agent:latest");
        assert_eq!(config.compose_file, "compose.test.yml");
        assert_eq!(config.service, "app");
        assert_eq!(config.infra_services, vec!["mysql", "redis"]);
    }

    #[test]
    fn test_generate_run_dir_unique() {
        let base = tempdir().unwrap();
        let a = generate_run_dir(base.path()).unwrap();
        let b = generate_run_dir(base.path()).unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
        assert!(a.starts_with(base.path().join("runs")));
    }
}
