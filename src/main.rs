use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "weaver")]
#[command(version, about = "Multi-agent story orchestrator")]
pub struct Cli {
    /// One-shot mode: free-form task description
    pub task: Option<String>,

    /// Manifest file for multi-story mode
    #[arg(long, value_name = "PATH")]
    pub manifest: Option<PathBuf>,

    /// Number of concurrent agent workers
    #[arg(long, default_value = "1")]
    pub workers: usize,

    /// Resume from an existing state document instead of reinitializing
    #[arg(long)]
    pub resume: bool,

    /// Rebuild the agent container image before running
    #[arg(long)]
    pub build: bool,

    /// Project repository directory (defaults to the working directory)
    #[arg(long)]
    pub project_dir: Option<PathBuf>,

    /// Shared run directory for state, scratch, edits, and logs
    /// (defaults to a generated runs/<timestamp>_<id>/)
    #[arg(long)]
    pub run_dir: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let exit_code = match (cli.task.clone(), cli.manifest.clone()) {
        (Some(task), None) => cmd::run::run_one_shot(&cli, &task).await?,
        (None, Some(manifest)) => cmd::run::run_manifest(&cli, &manifest).await?,
        (Some(_), Some(_)) => {
            anyhow::bail!("provide either a task or --manifest, not both");
        }
        (None, None) => {
            anyhow::bail!("provide a task (one-shot mode) or --manifest <path>");
        }
    };

    std::process::exit(exit_code);
}
