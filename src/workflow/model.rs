//! Core data types for story workflows.
//!
//! Pure data: stories, steps, history entries, and the edit operations agents
//! may request. No I/O lives here — persistence is in `crate::state` and edit
//! validation in `crate::workflow::edit`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The ten step kinds, fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ContextGathering,
    Planning,
    Architecture,
    TestArchitecture,
    Coding,
    Linting,
    InitialTesting,
    Review,
    PruneTests,
    FinalReview,
}

impl StepKind {
    /// Snake-case name as it appears in state files and prompts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextGathering => "context_gathering",
            Self::Planning => "planning",
            Self::Architecture => "architecture",
            Self::TestArchitecture => "test_architecture",
            Self::Coding => "coding",
            Self::Linting => "linting",
            Self::InitialTesting => "initial_testing",
            Self::Review => "review",
            Self::PruneTests => "prune_tests",
            Self::FinalReview => "final_review",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step is waiting to run
    #[default]
    Pending,
    /// Step is currently executing
    InProgress,
    /// Step finished successfully
    Completed,
    /// Step was skipped via a workflow edit
    Skipped,
    /// Agent exited non-zero (non-timeout)
    Failed,
    /// Timeout or external termination
    Cancelled,
}

impl StepStatus {
    /// Terminal statuses can no longer be modified by edits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Skipped | Self::Failed | Self::Cancelled
        )
    }
}

/// Status of a story in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    /// Story has not been assigned to a worker
    #[default]
    Unclaimed,
    /// Story is assigned and executing steps
    InProgress,
    /// All steps finished, work integrated
    Completed,
    /// A step failed irrecoverably
    Failed,
    /// A dependency failed; story cannot start
    Blocked,
}

impl StoryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A single scheduled unit of agent work within a story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Story-scoped identifier, `step-NNN`
    pub id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub status: StepStatus,
    /// Task description; may be rewritten by edits while pending or on restart
    #[serde(default)]
    pub description: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Version-control revision recorded just before the step first started
    pub rev_at_start: Option<String>,
    /// The agent's structured summary; non-null iff the step completed
    pub notes: Option<String>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
    pub cost_usd: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Path to the captured event stream for this step
    pub log_file: Option<String>,
}

impl Step {
    /// Create a pending step with no execution record.
    pub fn new(id: impl Into<String>, kind: StepKind, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            status: StepStatus::Pending,
            description: description.into(),
            started_at: None,
            completed_at: None,
            rev_at_start: None,
            notes: None,
            error: None,
            skip_reason: None,
            restart_count: 0,
            cost_usd: None,
            input_tokens: None,
            output_tokens: None,
            log_file: None,
        }
    }
}

/// Lifecycle events recorded in a story's history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    StepStarted,
    StepCompleted,
    StepFailed,
    StepCancelled,
    StepSkipped,
    WorkflowEdit,
    StoryClaimed,
    StoryCompleted,
    StoryFailed,
}

/// Append-only audit record attached to a story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    pub worker_id: Option<u32>,
    pub step_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl HistoryEntry {
    pub fn new(action: HistoryAction, worker_id: Option<u32>, step_id: Option<&str>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            worker_id,
            step_id: step_id.map(String::from),
            details: serde_json::Map::new(),
        }
    }

    /// Attach a detail value, builder-style.
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// A unit of user intent realized as an ordered sequence of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub status: StoryStatus,
    pub worker_id: Option<u32>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            status: StoryStatus::Unclaimed,
            worker_id: None,
            claimed_at: None,
            completed_at: None,
            depends_on: Vec::new(),
            steps: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Numeric value of the next free step ID.
    ///
    /// IDs are monotone: the counter is one past the highest numeric suffix
    /// present in the step list, never below 11 (the default workflow ends at
    /// `step-010`).
    pub fn next_step_number(&self) -> u32 {
        let mut max_num = 10;
        for step in &self.steps {
            if let Some(num) = parse_step_number(&step.id) {
                max_num = max_num.max(num);
            }
        }
        max_num + 1
    }

    /// Allocate the next free step ID, `step-NNN`.
    pub fn next_step_id(&self) -> String {
        format!("step-{:03}", self.next_step_number())
    }

    pub fn find_step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn find_step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// First step still waiting to run, in list order.
    pub fn find_next_pending_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status == StepStatus::Pending)
    }

    /// IDs of the pending suffix (all pending steps, in order).
    pub fn pending_step_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }
}

fn parse_step_number(id: &str) -> Option<u32> {
    id.strip_prefix("step-")?.parse().ok()
}

/// The persisted state document: one record per story, keyed by ID.
///
/// `BTreeMap` keeps serialization order stable so a load/save round trip is
/// byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub manifest_file: String,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stories: BTreeMap<String, Story>,
}

impl WorkflowState {
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn new(manifest_file: impl Into<String>) -> Self {
        Self {
            version: Self::SCHEMA_VERSION,
            created_at: Utc::now(),
            manifest_file: manifest_file.into(),
            finished_at: None,
            stories: BTreeMap::new(),
        }
    }
}

/// Specification for a step created by an edit operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStepSpec {
    pub kind: StepKind,
    pub description: String,
}

/// A single workflow mutation requested by an agent.
///
/// Every operation carries a mandatory `reason`; target step IDs are present
/// where the operation addresses a specific step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum EditOp {
    /// Insert new steps after an existing step
    AddAfter {
        target_step_id: String,
        reason: String,
        new_steps: Vec<NewStepSpec>,
    },
    /// Replace a pending step with two or more new steps
    Split {
        target_step_id: String,
        reason: String,
        replacement_steps: Vec<NewStepSpec>,
    },
    /// Mark a pending step skipped
    Skip {
        target_step_id: String,
        reason: String,
    },
    /// Permute the pending-step suffix
    Reorder { reason: String, new_order: Vec<String> },
    /// Rewrite a pending step's description
    EditDescription {
        target_step_id: String,
        reason: String,
        new_description: String,
    },
    /// Revise the in-progress step's description and reset it to pending
    Restart {
        target_step_id: String,
        reason: String,
        new_description: String,
    },
}

impl EditOp {
    /// Operation tag as it appears in edit files and history entries.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AddAfter { .. } => "add_after",
            Self::Split { .. } => "split",
            Self::Skip { .. } => "skip",
            Self::Reorder { .. } => "reorder",
            Self::EditDescription { .. } => "edit_description",
            Self::Restart { .. } => "restart",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::InProgress.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_next_step_id_starts_after_default_workflow() {
        let story = Story::new("US-001", "Test");
        assert_eq!(story.next_step_id(), "step-011");
    }

    #[test]
    fn test_next_step_id_tracks_highest_existing() {
        let mut story = Story::new("US-001", "Test");
        story
            .steps
            .push(Step::new("step-014", StepKind::Coding, "extra"));
        assert_eq!(story.next_step_id(), "step-015");
    }

    #[test]
    fn test_next_step_id_ignores_malformed_ids() {
        let mut story = Story::new("US-001", "Test");
        story
            .steps
            .push(Step::new("bogus", StepKind::Coding, "weird"));
        assert_eq!(story.next_step_id(), "step-011");
    }

    #[test]
    fn test_find_next_pending_step_in_order() {
        let mut story = Story::new("US-001", "Test");
        let mut done = Step::new("step-001", StepKind::ContextGathering, "a");
        done.status = StepStatus::Completed;
        story.steps.push(done);
        story.steps.push(Step::new("step-002", StepKind::Planning, "b"));
        story.steps.push(Step::new("step-003", StepKind::Coding, "c"));

        assert_eq!(story.find_next_pending_step().unwrap().id, "step-002");
    }

    #[test]
    fn test_edit_op_tag_round_trip() {
        let json = r#"{"operation":"skip","target_step_id":"step-004","reason":"not needed"}"#;
        let op: EditOp = serde_json::from_str(json).unwrap();
        assert_eq!(op.tag(), "skip");

        let back = serde_json::to_value(&op).unwrap();
        assert_eq!(back.get("operation").unwrap(), "skip");
    }

    #[test]
    fn test_step_kind_serializes_snake_case() {
        let v = serde_json::to_value(StepKind::FinalReview).unwrap();
        assert_eq!(v, "final_review");
        assert_eq!(StepKind::FinalReview.as_str(), "final_review");
    }

    #[test]
    fn test_history_entry_details_builder() {
        let entry = HistoryEntry::new(HistoryAction::StepFailed, Some(2), Some("step-005"))
            .with_detail("exit_code", 1);
        assert_eq!(entry.details.get("exit_code").unwrap(), 1);
        assert_eq!(entry.step_id.as_deref(), Some("step-005"));
    }
}
