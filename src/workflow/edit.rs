//! Workflow editing: the drop box, guardrail validation, and application.
//!
//! Agents request mutations of their story's remaining workflow by writing a
//! JSON file into the edit drop box (`<run>/edits/<story-id>.json`). The
//! orchestrator consumes each file exactly once: parse, validate every
//! operation against the guardrails, then apply all of them or none.
//!
//! Rejected or unparseable files are moved to `edits/failed/` for debugging;
//! accepted files are deleted after application.

use crate::errors::EditError;
use crate::workflow::model::{
    EditOp, HistoryAction, HistoryEntry, NewStepSpec, Step, StepKind, StepStatus, Story,
};
use crate::workflow::steps::{is_mandatory, MAX_RESTARTS_PER_STEP, MAX_STEPS_PER_STORY};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn edit_path(edits_dir: &Path, story_id: &str) -> PathBuf {
    edits_dir.join(format!("{story_id}.json"))
}

/// Read and parse the pending edit file for a story.
///
/// Returns `Ok(None)` when no file exists. The file body may be a single
/// operation object or a list of them.
pub fn parse_edit_file(edits_dir: &Path, story_id: &str) -> Result<Option<Vec<EditOp>>, EditError> {
    let path = edit_path(edits_dir, story_id);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EditError::Parse(serde_json::Error::io(e))),
    };

    let value: serde_json::Value = serde_json::from_str(&text)?;
    let operations = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<EditOp>, _>>()?,
        obj @ serde_json::Value::Object(_) => vec![serde_json::from_value(obj)?],
        _ => return Err(EditError::NotAnOperationList),
    };

    Ok(Some(operations))
}

/// Move a rejected edit file into `edits/failed/` so it can be inspected.
pub fn discard_edit_file(edits_dir: &Path, story_id: &str) -> Result<()> {
    let path = edit_path(edits_dir, story_id);
    if !path.exists() {
        return Ok(());
    }
    let failed_dir = edits_dir.join("failed");
    std::fs::create_dir_all(&failed_dir)
        .with_context(|| format!("create {}", failed_dir.display()))?;
    std::fs::rename(&path, failed_dir.join(format!("{story_id}.json")))
        .with_context(|| format!("move rejected edit file {}", path.display()))?;
    Ok(())
}

/// Delete the edit file after successful application.
pub fn remove_edit_file(edits_dir: &Path, story_id: &str) -> Result<()> {
    let path = edit_path(edits_dir, story_id);
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("remove applied edit file {}", path.display()))?;
    }
    Ok(())
}

/// Validate every operation against the guardrails.
///
/// Validation is atomic: all operations are checked before any are applied,
/// and every violation found is reported, not just the first. The requesting
/// worker must be the story's assigned worker.
pub fn validate_edits(
    story: &Story,
    operations: &[EditOp],
    requesting_worker: u32,
) -> Result<(), EditError> {
    if story.worker_id != Some(requesting_worker) {
        return Err(EditError::WrongWorker {
            story_id: story.id.clone(),
            requesting: requesting_worker,
        });
    }

    let mut errors: Vec<String> = Vec::new();

    // Step count is simulated across the whole file so the 30-step cap sees
    // the combined effect of every operation.
    let mut simulated_count = story.steps.len();

    for op in operations {
        match op {
            EditOp::AddAfter {
                target_step_id,
                new_steps,
                ..
            } => {
                match story.find_step(target_step_id) {
                    None => {
                        errors.push(format!("add_after: target step '{target_step_id}' not found"))
                    }
                    Some(target) if target.kind == StepKind::FinalReview => {
                        errors.push("add_after: cannot add steps after final_review".to_string())
                    }
                    Some(_) => {}
                }
                if new_steps.is_empty() {
                    errors.push("add_after: new_steps must not be empty".to_string());
                }
                simulated_count += new_steps.len();
            }

            EditOp::Split {
                target_step_id,
                replacement_steps,
                ..
            } => {
                match story.find_step(target_step_id) {
                    None => errors.push(format!("split: target step '{target_step_id}' not found")),
                    Some(target) if target.status != StepStatus::Pending => errors.push(format!(
                        "split: can only split pending steps, '{target_step_id}' is {}",
                        status_name(target.status)
                    )),
                    Some(target) if is_mandatory(target.kind) => errors.push(format!(
                        "split: cannot split mandatory step kind '{}'",
                        target.kind
                    )),
                    Some(_) => {}
                }
                if replacement_steps.len() < 2 {
                    errors.push("split: must provide at least two replacement steps".to_string());
                }
                simulated_count += replacement_steps.len();
                simulated_count = simulated_count.saturating_sub(1);
            }

            EditOp::Skip { target_step_id, .. } => match story.find_step(target_step_id) {
                None => errors.push(format!("skip: target step '{target_step_id}' not found")),
                Some(target) if target.status != StepStatus::Pending => errors.push(format!(
                    "skip: can only skip pending steps, '{target_step_id}' is {}",
                    status_name(target.status)
                )),
                Some(target) if is_mandatory(target.kind) => errors.push(format!(
                    "skip: cannot skip mandatory step kind '{}'",
                    target.kind
                )),
                Some(_) => {}
            },

            EditOp::Reorder { new_order, .. } => {
                let pending_ids = story.pending_step_ids();
                let expected: HashSet<&str> = pending_ids.iter().map(String::as_str).collect();
                let got: HashSet<&str> = new_order.iter().map(String::as_str).collect();
                if expected != got || new_order.len() != pending_ids.len() {
                    errors.push(format!(
                        "reorder: new_order must contain exactly the pending step IDs \
                         (expected {pending_ids:?}, got {new_order:?})"
                    ));
                }
                // final_review, if pending, must stay last
                let final_review_id = story
                    .steps
                    .iter()
                    .find(|s| s.status == StepStatus::Pending && s.kind == StepKind::FinalReview)
                    .map(|s| s.id.as_str());
                if let Some(fr_id) = final_review_id {
                    if new_order.last().map(String::as_str) != Some(fr_id) {
                        errors.push("reorder: final_review must remain the last step".to_string());
                    }
                }
            }

            EditOp::EditDescription { target_step_id, .. } => {
                match story.find_step(target_step_id) {
                    None => errors.push(format!(
                        "edit_description: target step '{target_step_id}' not found"
                    )),
                    Some(target) if target.status != StepStatus::Pending => errors.push(format!(
                        "edit_description: can only edit pending steps, '{target_step_id}' is {}",
                        status_name(target.status)
                    )),
                    Some(_) => {}
                }
            }

            EditOp::Restart { target_step_id, .. } => match story.find_step(target_step_id) {
                None => errors.push(format!("restart: target step '{target_step_id}' not found")),
                Some(target) if target.status != StepStatus::InProgress => errors.push(format!(
                    "restart: can only restart the in_progress step, '{target_step_id}' is {}",
                    status_name(target.status)
                )),
                Some(target) if target.restart_count >= MAX_RESTARTS_PER_STEP => {
                    errors.push(format!(
                        "restart: step '{target_step_id}' has reached max restarts ({MAX_RESTARTS_PER_STEP})"
                    ))
                }
                Some(_) => {}
            },
        }
    }

    if simulated_count > MAX_STEPS_PER_STORY {
        errors.push(format!(
            "Total steps would be {simulated_count}, exceeding maximum of {MAX_STEPS_PER_STORY}"
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(EditError::Validation(errors))
    }
}

/// Apply validated operations to a story and record one history entry each.
///
/// Call [`validate_edits`] first — application assumes every operation passed.
pub fn apply_edits(story: &mut Story, operations: &[EditOp], worker_id: u32) {
    for op in operations {
        let acting_step_id = match op {
            EditOp::AddAfter { target_step_id, .. }
            | EditOp::Split { target_step_id, .. }
            | EditOp::Skip { target_step_id, .. }
            | EditOp::EditDescription { target_step_id, .. }
            | EditOp::Restart { target_step_id, .. } => Some(target_step_id.clone()),
            EditOp::Reorder { .. } => None,
        };

        match op {
            EditOp::AddAfter {
                target_step_id,
                new_steps,
                ..
            } => apply_add_after(story, target_step_id, new_steps),
            EditOp::Split {
                target_step_id,
                replacement_steps,
                ..
            } => apply_split(story, target_step_id, replacement_steps),
            EditOp::Skip {
                target_step_id,
                reason,
            } => apply_skip(story, target_step_id, reason),
            EditOp::Reorder { new_order, .. } => apply_reorder(story, new_order),
            EditOp::EditDescription {
                target_step_id,
                new_description,
                ..
            } => apply_edit_description(story, target_step_id, new_description),
            EditOp::Restart {
                target_step_id,
                new_description,
                ..
            } => apply_restart(story, target_step_id, new_description),
        }

        let entry = HistoryEntry::new(
            HistoryAction::WorkflowEdit,
            Some(worker_id),
            acting_step_id.as_deref(),
        )
        .with_detail("operation", op.tag())
        .with_detail(
            "edit",
            serde_json::to_value(op).unwrap_or(serde_json::Value::Null),
        );
        story.push_history(entry);
    }
}

fn build_new_steps(story: &Story, specs: &[NewStepSpec]) -> Vec<Step> {
    let mut next = story.next_step_number();
    specs
        .iter()
        .map(|spec| {
            let step = Step::new(format!("step-{next:03}"), spec.kind, &spec.description);
            next += 1;
            step
        })
        .collect()
}

fn apply_add_after(story: &mut Story, target_step_id: &str, specs: &[NewStepSpec]) {
    let Some(target_idx) = story.steps.iter().position(|s| s.id == target_step_id) else {
        return;
    };
    let new_steps = build_new_steps(story, specs);
    story.steps.splice(target_idx + 1..target_idx + 1, new_steps);
}

fn apply_split(story: &mut Story, target_step_id: &str, specs: &[NewStepSpec]) {
    let Some(target_idx) = story.steps.iter().position(|s| s.id == target_step_id) else {
        return;
    };
    let new_steps = build_new_steps(story, specs);
    story.steps.splice(target_idx..target_idx + 1, new_steps);
}

fn apply_skip(story: &mut Story, target_step_id: &str, reason: &str) {
    if let Some(step) = story.find_step_mut(target_step_id) {
        step.status = StepStatus::Skipped;
        step.skip_reason = Some(reason.to_string());
    }
}

fn apply_reorder(story: &mut Story, new_order: &[String]) {
    let mut non_pending: Vec<Step> = Vec::new();
    let mut pending: Vec<Step> = Vec::new();
    for step in story.steps.drain(..) {
        if step.status == StepStatus::Pending {
            pending.push(step);
        } else {
            non_pending.push(step);
        }
    }
    // Non-pending steps keep their position; the pending suffix is permuted.
    let mut reordered: Vec<Step> = new_order
        .iter()
        .filter_map(|id| pending.iter().position(|s| &s.id == id).map(|i| pending.remove(i)))
        .collect();
    non_pending.append(&mut reordered);
    story.steps = non_pending;
}

fn apply_edit_description(story: &mut Story, target_step_id: &str, new_description: &str) {
    if let Some(step) = story.find_step_mut(target_step_id) {
        step.description = new_description.to_string();
    }
}

fn apply_restart(story: &mut Story, target_step_id: &str, new_description: &str) {
    if let Some(step) = story.find_step_mut(target_step_id) {
        step.description = new_description.to_string();
        step.status = StepStatus::Pending;
        step.restart_count += 1;
        step.started_at = None;
        step.completed_at = None;
        step.notes = None;
        step.error = None;
        step.cost_usd = None;
        step.input_tokens = None;
        step.output_tokens = None;
        step.log_file = None;
    }
}

fn status_name(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::InProgress => "in_progress",
        StepStatus::Completed => "completed",
        StepStatus::Skipped => "skipped",
        StepStatus::Failed => "failed",
        StepStatus::Cancelled => "cancelled",
    }
}
