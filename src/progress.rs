//! Terminal progress reporting and the run summary log.
//!
//! One stories bar tracks overall completion; each worker slot gets a
//! spinner showing the step it is currently driving. Every reported line is
//! also appended, timestamped, to `<run>/summary.log` so a run can be
//! reconstructed after the terminal is gone.

use chrono::Utc;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

pub struct Reporter {
    multi: MultiProgress,
    stories_bar: ProgressBar,
    worker_bars: Mutex<HashMap<u32, ProgressBar>>,
    summary_path: PathBuf,
    verbose: bool,
}

impl Reporter {
    pub fn new(total_stories: u64, summary_path: PathBuf, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let stories_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let stories_bar = multi.add(ProgressBar::new(total_stories));
        stories_bar.set_style(stories_style);
        stories_bar.set_prefix("Stories");

        Self {
            multi,
            stories_bar,
            worker_bars: Mutex::new(HashMap::new()),
            summary_path,
            verbose,
        }
    }

    /// Print a line above the bars, falling back to stderr if the rich UI is
    /// unavailable, and append it to the summary log.
    pub fn announce(&self, msg: &str) {
        if self.multi.println(msg).is_err() {
            eprintln!("{msg}");
        }
        self.append_summary(msg);
    }

    /// Verbose-only dim line; still recorded in the summary log.
    pub fn detail(&self, msg: &str) {
        if self.verbose {
            let line = format!("    {} {}", style("→").dim(), style(msg).dim());
            if self.multi.println(&line).is_err() {
                eprintln!("{line}");
            }
        }
        self.append_summary(msg);
    }

    /// Register a worker slot spinner when a story is claimed.
    pub fn worker_started(&self, worker_id: u32, story_id: &str, title: &str) {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style);
        bar.set_prefix(format!("  W{worker_id}"));
        bar.set_message(format!("[{}] {}", style(story_id).yellow(), title));
        bar.enable_steady_tick(Duration::from_millis(120));
        self.worker_bars
            .lock()
            .expect("worker bar map lock")
            .insert(worker_id, bar);
        self.append_summary(&format!("worker {worker_id} claimed [{story_id}] {title}"));
    }

    /// Update a worker spinner with the step currently running.
    pub fn worker_step(&self, worker_id: u32, story_id: &str, step_id: &str, kind: &str) {
        if let Some(bar) = self
            .worker_bars
            .lock()
            .expect("worker bar map lock")
            .get(&worker_id)
        {
            bar.set_message(format!(
                "[{}] {} {}",
                style(story_id).yellow(),
                step_id,
                style(format!("({kind})")).dim()
            ));
        }
    }

    /// Short live status on a worker spinner (tool use, elapsed time).
    pub fn worker_status(&self, worker_id: u32, status: &str) {
        if let Some(bar) = self
            .worker_bars
            .lock()
            .expect("worker bar map lock")
            .get(&worker_id)
        {
            let msg = bar.message();
            let base = msg.split(" — ").next().unwrap_or(&msg).to_string();
            bar.set_message(format!("{base} — {}", style(status).dim()));
        }
    }

    /// Remove a worker spinner and advance the stories bar on success.
    pub fn worker_finished(&self, worker_id: u32, story_id: &str, success: bool) {
        if let Some(bar) = self
            .worker_bars
            .lock()
            .expect("worker bar map lock")
            .remove(&worker_id)
        {
            bar.finish_and_clear();
        }
        if success {
            self.stories_bar.inc(1);
            self.announce(&format!(
                "  {} story [{story_id}] completed",
                style("✓").green()
            ));
        } else {
            self.announce(&format!(
                "  {} story [{story_id}] FAILED",
                style("✗").red()
            ));
        }
    }

    /// Final status-count line, e.g. `5 stories — completed=3, failed=1, blocked=1`.
    pub fn status_summary(&self, counts: &[(String, usize)], total: usize) {
        let parts: Vec<String> = counts
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .collect();
        self.announce(&format!(
            "  Status: {total} stories — {}",
            parts.join(", ")
        ));
    }

    pub fn finish(&self) {
        self.stories_bar.finish_and_clear();
    }

    fn append_summary(&self, message: &str) {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let clean = message.replace(['\n', '\r'], " ");
        let clean = console::strip_ansi_codes(&clean).to_string();
        let line = format!("[{ts} UTC] {}\n", clean.trim());
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.summary_path)
        {
            use std::io::Write;
            let _ = file.write_all(line.as_bytes());
        }
    }
}
