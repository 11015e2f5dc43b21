//! Scratch files: persistent memory shared across workflow steps.
//!
//! Two scopes with different locking disciplines:
//! - `scratch.md` (global) — written concurrently by many workers, every
//!   write under the scratch lock file
//! - `scratch_<story_id>.md` (per-story) — exactly one writer while the
//!   story is in progress, so no lock is taken

use crate::state::lock::{FileLock, LOCK_TIMEOUT};
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

const GLOBAL_SCRATCH: &str = "scratch.md";
const GLOBAL_SCRATCH_LOCK: &str = "scratch.md.lock";

fn global_path(shared_dir: &Path) -> PathBuf {
    shared_dir.join(GLOBAL_SCRATCH)
}

fn global_lock_path(shared_dir: &Path) -> PathBuf {
    shared_dir.join(GLOBAL_SCRATCH_LOCK)
}

fn story_path(shared_dir: &Path, story_id: &str) -> PathBuf {
    shared_dir.join(format!("scratch_{story_id}.md"))
}

/// Read the global scratch; empty string when the file does not exist.
pub fn read_global(shared_dir: &Path) -> String {
    std::fs::read_to_string(global_path(shared_dir)).unwrap_or_default()
}

/// Replace the global scratch under the lock, via temp file + rename.
pub fn write_global(shared_dir: &Path, content: &str) -> Result<()> {
    let _lock = FileLock::acquire(&global_lock_path(shared_dir), LOCK_TIMEOUT)?;
    let mut tmp = tempfile::Builder::new()
        .suffix(".tmp")
        .tempfile_in(shared_dir)
        .context("create global scratch temp file")?;
    tmp.write_all(content.as_bytes())
        .context("write global scratch")?;
    tmp.persist(global_path(shared_dir))
        .context("replace global scratch")?;
    Ok(())
}

/// Append a line to the global scratch under the lock; creates the file.
pub fn append_global(shared_dir: &Path, message: &str) -> Result<()> {
    let _lock = FileLock::acquire(&global_lock_path(shared_dir), LOCK_TIMEOUT)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(global_path(shared_dir))
        .context("open global scratch for append")?;
    writeln!(file, "{message}").context("append to global scratch")?;
    Ok(())
}

/// Read a story's scratch; empty string when the file does not exist.
pub fn read_story(shared_dir: &Path, story_id: &str) -> String {
    std::fs::read_to_string(story_path(shared_dir, story_id)).unwrap_or_default()
}

/// Replace a story's scratch. Single writer per story, no lock.
pub fn write_story(shared_dir: &Path, story_id: &str, content: &str) -> Result<()> {
    std::fs::write(story_path(shared_dir, story_id), content)
        .with_context(|| format!("write scratch for {story_id}"))
}

/// Append a line to a story's scratch; creates the file.
pub fn append_story(shared_dir: &Path, story_id: &str, message: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(story_path(shared_dir, story_id))
        .with_context(|| format!("open scratch for {story_id}"))?;
    writeln!(file, "{message}").with_context(|| format!("append scratch for {story_id}"))
}

/// Archive a completed story's scratch so composed prompts stop growing.
///
/// The file is renamed to `scratch_<story_id>.archived.md`; it stays on disk
/// for retrospection but is no longer picked up by prompt composition.
pub fn archive_story(shared_dir: &Path, story_id: &str) -> Result<()> {
    let path = story_path(shared_dir, story_id);
    if !path.exists() {
        return Ok(());
    }
    let archived = shared_dir.join(format!("scratch_{story_id}.archived.md"));
    std::fs::rename(&path, &archived)
        .with_context(|| format!("archive scratch for {story_id}"))?;
    Ok(())
}
