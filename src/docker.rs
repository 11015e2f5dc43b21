//! Container-runtime helpers for sandboxed agent invocations.
//!
//! The runtime itself is an external collaborator; the core only issues
//! `docker image inspect`, `docker build`, and assembles the `docker run`
//! argument vector used by the agent launcher.

use crate::config::Config;
use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

/// Check whether the agent image exists locally.
pub fn image_exists(image: &str) -> bool {
    Command::new("docker")
        .args(["image", "inspect", image])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Build the agent image from the configured Dockerfile.
pub fn build_image(config: &Config) -> Result<()> {
    println!("==> Building {}...", config.image);
    let status = Command::new("docker")
        .args([
            "build",
            "-t",
            &config.image,
            "-f",
            &config.dockerfile,
            ".",
        ])
        .current_dir(&config.project_dir)
        .status()
        .context("spawn docker build")?;
    if !status.success() {
        anyhow::bail!("docker build failed for image {}", config.image);
    }
    Ok(())
}

/// GID of the docker socket, for `--group-add` so the agent can reach the
/// daemon from inside the container.
#[cfg(unix)]
pub fn docker_sock_gid() -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/var/run/docker.sock")
        .ok()
        .map(|m| m.gid().to_string())
}

#[cfg(not(unix))]
pub fn docker_sock_gid() -> Option<String> {
    None
}

/// Assemble the `docker run` argument vector wrapping an agent command.
///
/// The workspace is bind-mounted at `/workspace`, the agent's credential
/// directories are passed through, and the git identity from the environment
/// contract is exported for commits made inside the container.
pub fn wrap_in_docker(
    config: &Config,
    base_cmd: &[String],
    worker_id: u32,
    workspace: &Path,
) -> Vec<String> {
    let workspace = workspace.display().to_string();
    let compose_project = format!("weaver_worker_{worker_id}");
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());

    let mut cmd: Vec<String> = vec!["docker".into(), "run".into(), "--rm".into()];
    if let Some(gid) = docker_sock_gid() {
        cmd.push("--group-add".into());
        cmd.push(gid);
    }
    for (key, value) in [
        ("WORKER_ID", worker_id.to_string()),
        ("COMPOSE_PROJECT_NAME", compose_project),
        ("HOST_WORKSPACE", workspace.clone()),
        ("IS_SANDBOX", "1".to_string()),
        ("GIT_AUTHOR_NAME", config.git_author_name.clone()),
        ("GIT_AUTHOR_EMAIL", config.git_author_email.clone()),
        ("GIT_COMMITTER_NAME", config.git_author_name.clone()),
        ("GIT_COMMITTER_EMAIL", config.git_author_email.clone()),
    ] {
        cmd.push("-e".into());
        cmd.push(format!("{key}={value}"));
    }
    for volume in [
        "/var/run/docker.sock:/var/run/docker.sock".to_string(),
        format!("{workspace}:/workspace"),
        format!("{home}/.claude:/home/agent/.claude"),
        format!("{home}/.config/claude:/home/agent/.config/claude"),
    ] {
        cmd.push("-v".into());
        cmd.push(volume);
    }
    cmd.push("-w".into());
    cmd.push("/workspace".into());
    cmd.push(config.image.clone());
    cmd.extend(base_cmd.iter().cloned());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> (tempfile::TempDir, tempfile::TempDir, Config) {
        let project = tempdir().unwrap();
        let run = tempdir().unwrap();
        let config =
            Config::new(project.path().to_path_buf(), run.path().to_path_buf(), false).unwrap();
        (project, run, config)
    }

    #[test]
    fn test_wrap_in_docker_shape() {
        let (_p, _r, config) = test_config();
        let base: Vec<String> = vec!["agent".into(), "--print".into(), "prompt".into()];
        let cmd = wrap_in_docker(&config, &base, 2, Path::new("/tmp/wt"));

        assert_eq!(&cmd[..3], &["docker", "run", "--rm"]);
        assert!(cmd.contains(&"WORKER_ID=2".to_string()));
        assert!(cmd.contains(&"/tmp/wt:/workspace".to_string()));
        assert!(cmd.contains(&config.image));
        // base command preserved at the tail
        assert_eq!(&cmd[cmd.len() - 3..], &["agent", "--print", "prompt"]);
    }

    #[test]
    fn test_wrap_exports_git_identity() {
        let (_p, _r, config) = test_config();
        let cmd = wrap_in_docker(&config, &["agent".into()], 1, Path::new("/w"));
        assert!(cmd
            .iter()
            .any(|a| a.starts_with("GIT_AUTHOR_EMAIL=")));
        assert!(cmd
            .iter()
            .any(|a| a.starts_with("GIT_COMMITTER_NAME=")));
    }
}
