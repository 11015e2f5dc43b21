//! Agent backend launcher.
//!
//! The agent is an opaque external process: it consumes a composed prompt
//! and emits a stream-json event log plus a final summary. This module
//! builds the invocation (optionally wrapped in `docker run`), streams and
//! mirrors the event log to the step's log file, enforces the step timeout,
//! and collects the counters from the terminal `result` event.

use crate::config::Config;
use crate::docker::wrap_in_docker;
use crate::errors::OrchestratorError;
use crate::progress::Reporter;
use crate::stream::{describe_tool_use, truncate_snippet, ContentBlock, StreamEvent};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

/// Everything captured from one agent invocation.
#[derive(Debug, Default)]
pub struct AgentOutcome {
    pub exit_code: i32,
    pub num_turns: u32,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub completion_status: String,
    /// Last assistant text block; the summary is extracted from it
    pub final_response: String,
    pub timed_out: bool,
}

/// Extract the SUMMARY section from agent output.
///
/// Finds the last line whose text (after stripping markdown `#` markers)
/// starts with `SUMMARY` and returns everything after it; a same-line
/// `SUMMARY: ...` form is accepted as a fallback.
pub fn extract_summary(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let idx = lines.iter().rposition(|line| {
        line.trim()
            .trim_start_matches('#')
            .trim()
            .to_uppercase()
            .starts_with("SUMMARY")
    })?;

    let remaining = lines[idx + 1..].join("\n").trim().to_string();
    if !remaining.is_empty() {
        return Some(remaining);
    }

    let header = lines[idx].trim().trim_start_matches('#').trim();
    let after_keyword = header["SUMMARY".len().min(header.len())..]
        .trim_start_matches(':')
        .trim();
    (!after_keyword.is_empty()).then(|| after_keyword.to_string())
}

/// Build the bare agent command: configured executable + flags + prompt.
fn build_agent_command(config: &Config, prompt: &str) -> Vec<String> {
    let mut cmd: Vec<String> = config
        .agent_cmd
        .split_whitespace()
        .map(String::from)
        .collect();
    cmd.extend(
        [
            "--dangerously-skip-permissions",
            "--print",
            "--verbose",
            "--output-format",
            "stream-json",
        ]
        .map(String::from),
    );
    cmd.push(prompt.to_string());
    cmd
}

/// Launch the agent and stream its output until exit or timeout.
///
/// The raw event stream is mirrored to `log_path`; unparseable lines are
/// prefixed with `# ` so the log stays valid JSONL.
pub async fn launch_agent(
    config: &Config,
    prompt: &str,
    worker_id: u32,
    workdir: &Path,
    log_path: &Path,
    timeout: Duration,
    reporter: &Reporter,
) -> Result<AgentOutcome> {
    let base_cmd = build_agent_command(config, prompt);
    let cmd: Vec<String> = if config.no_docker {
        base_cmd
    } else {
        wrap_in_docker(config, &base_cmd, worker_id, workdir)
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut log_file = tokio::fs::File::create(log_path)
        .await
        .with_context(|| format!("create agent log {}", log_path.display()))?;

    let mut child = Command::new(&cmd[0])
        .args(&cmd[1..])
        .current_dir(workdir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(OrchestratorError::SpawnFailed)?;

    let stdout = child
        .stdout
        .take()
        .context("agent process has no stdout handle")?;
    let mut reader = BufReader::new(stdout).lines();

    let mut outcome = AgentOutcome {
        exit_code: 1,
        ..Default::default()
    };
    let deadline = Instant::now() + timeout;

    loop {
        let line = match tokio::time::timeout_at(deadline, reader.next_line()).await {
            Err(_) => {
                // Timeout: kill the agent and report cancellation upstream.
                let _ = child.start_kill();
                let _ = child.wait().await;
                outcome.timed_out = true;
                return Ok(outcome);
            }
            Ok(read) => read.context("read agent stdout")?,
        };
        let Some(line) = line else { break };
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }

        match serde_json::from_str::<StreamEvent>(stripped) {
            Ok(event) => {
                log_file.write_all(line.as_bytes()).await.ok();
                log_file.write_all(b"\n").await.ok();

                match event {
                    StreamEvent::Assistant { message, .. } => {
                        for block in message.content {
                            match block {
                                ContentBlock::ToolUse { name, input, .. } => {
                                    reporter
                                        .worker_status(worker_id, &describe_tool_use(&name, &input));
                                }
                                ContentBlock::Text { text } => {
                                    let snippet = truncate_snippet(&text, 60);
                                    if !snippet.is_empty() {
                                        reporter.worker_status(worker_id, &snippet);
                                    }
                                    outcome.final_response = text;
                                }
                            }
                        }
                    }
                    StreamEvent::Result {
                        subtype,
                        num_turns,
                        total_cost_usd,
                        usage,
                        ..
                    } => {
                        outcome.completion_status = subtype;
                        outcome.num_turns = num_turns;
                        outcome.cost_usd = total_cost_usd;
                        if let Some(usage) = usage {
                            outcome.input_tokens = usage.input_tokens;
                            outcome.output_tokens = usage.output_tokens;
                        }
                    }
                    StreamEvent::User { .. } | StreamEvent::System { .. } => {}
                }
            }
            Err(_) => {
                // Not an event; keep it in the log for debugging.
                log_file.write_all(b"# ").await.ok();
                log_file.write_all(line.as_bytes()).await.ok();
                log_file.write_all(b"\n").await.ok();
            }
        }
    }

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            outcome.timed_out = true;
            return Ok(outcome);
        }
        Ok(status) => status.context("wait for agent process")?,
    };
    outcome.exit_code = status.code().unwrap_or(-1);
    log_file.flush().await.ok();

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_summary_after_heading() {
        let text = "I did the work.\n\n## SUMMARY\nChanged foo.rs\nAdded tests";
        assert_eq!(
            extract_summary(text).as_deref(),
            Some("Changed foo.rs\nAdded tests")
        );
    }

    #[test]
    fn test_extract_summary_same_line_colon_form() {
        let text = "details...\nSUMMARY: all acceptance criteria pass";
        assert_eq!(
            extract_summary(text).as_deref(),
            Some("all acceptance criteria pass")
        );
    }

    #[test]
    fn test_extract_summary_uses_last_heading() {
        let text = "SUMMARY\nearly summary\n\nmore work\n\nSUMMARY\nfinal summary";
        assert_eq!(extract_summary(text).as_deref(), Some("final summary"));
    }

    #[test]
    fn test_extract_summary_missing() {
        assert_eq!(extract_summary("no heading here"), None);
        assert_eq!(extract_summary(""), None);
    }

    #[test]
    fn test_extract_summary_case_insensitive() {
        let text = "# Summary\nlowercase heading works";
        assert_eq!(
            extract_summary(text).as_deref(),
            Some("lowercase heading works")
        );
    }

    fn stub_config(script_body: &str) -> (tempfile::TempDir, tempfile::TempDir, Config) {
        let project = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();
        let script = project.path().join("stub-agent.sh");
        std::fs::write(&script, script_body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
        }
        let mut config = Config::new(
            project.path().to_path_buf(),
            run.path().to_path_buf(),
            false,
        )
        .unwrap();
        config.agent_cmd = script.display().to_string();
        config.no_docker = true;
        (project, run, config)
    }

    #[tokio::test]
    async fn test_launch_agent_captures_stream_and_metrics() {
        let (_p, run, config) = stub_config(
            "#!/bin/sh\n\
             printf '%s\\n' '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"did work\\n\\nSUMMARY\\nall good\"}]}}'\n\
             printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"num_turns\":4,\"total_cost_usd\":0.05,\"usage\":{\"input_tokens\":500,\"output_tokens\":80}}'\n",
        );
        let reporter = Reporter::new(1, config.summary_log_path(), false);
        let log_path = run.path().join("logs/US-001/step-001.jsonl");

        let outcome = launch_agent(
            &config,
            "prompt",
            1,
            &config.project_dir,
            &log_path,
            Duration::from_secs(10),
            &reporter,
        )
        .await
        .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.num_turns, 4);
        assert_eq!(outcome.input_tokens, 500);
        assert_eq!(outcome.output_tokens, 80);
        assert_eq!(outcome.completion_status, "success");
        assert_eq!(extract_summary(&outcome.final_response).as_deref(), Some("all good"));
        // event stream mirrored to the log file
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_launch_agent_timeout_kills_process() {
        let (_p, run, config) = stub_config("#!/bin/sh\nsleep 30\n");
        let reporter = Reporter::new(1, config.summary_log_path(), false);
        let log_path = run.path().join("logs/US-001/step-001.jsonl");

        let start = std::time::Instant::now();
        let outcome = launch_agent(
            &config,
            "prompt",
            1,
            &config.project_dir,
            &log_path,
            Duration::from_millis(300),
            &reporter,
        )
        .await
        .unwrap();

        assert!(outcome.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_launch_agent_nonzero_exit() {
        let (_p, run, config) = stub_config("#!/bin/sh\nexit 3\n");
        let reporter = Reporter::new(1, config.summary_log_path(), false);
        let log_path = run.path().join("logs/US-001/step-001.jsonl");

        let outcome = launch_agent(
            &config,
            "prompt",
            1,
            &config.project_dir,
            &log_path,
            Duration::from_secs(10),
            &reporter,
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn test_build_agent_command_splits_configured_cmd() {
        let project = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();
        let mut config = Config::new(
            project.path().to_path_buf(),
            run.path().to_path_buf(),
            false,
        )
        .unwrap();
        config.agent_cmd = "npx @anthropic-ai/claude-code".to_string();

        let cmd = build_agent_command(&config, "do the thing");
        assert_eq!(&cmd[..2], &["npx", "@anthropic-ai/claude-code"]);
        assert!(cmd.contains(&"--output-format".to_string()));
        assert_eq!(cmd.last().unwrap(), "do the thing");
    }
}
