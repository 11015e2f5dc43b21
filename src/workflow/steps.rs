//! Step-kind metadata, the default workflow, and workflow limits.

use crate::workflow::model::{Step, StepKind};
use std::time::Duration;

/// Hard cap on the number of steps a story may accumulate through edits.
pub const MAX_STEPS_PER_STORY: usize = 30;

/// Maximum number of times a single step may be restarted.
pub const MAX_RESTARTS_PER_STEP: u32 = 3;

/// Execution timeout for a step of the given kind.
pub fn step_timeout(kind: StepKind) -> Duration {
    let secs = match kind {
        StepKind::ContextGathering => 900,
        StepKind::Planning => 600,
        StepKind::Architecture => 600,
        StepKind::TestArchitecture => 600,
        StepKind::Coding => 1800,
        StepKind::Linting => 300,
        StepKind::InitialTesting => 1200,
        StepKind::Review => 600,
        StepKind::PruneTests => 600,
        StepKind::FinalReview => 900,
    };
    Duration::from_secs(secs)
}

/// Whether an agent executing a step of this kind may request workflow edits.
pub fn allows_editing(kind: StepKind) -> bool {
    match kind {
        StepKind::ContextGathering => false,
        StepKind::Planning => true,
        StepKind::Architecture => true,
        StepKind::TestArchitecture => true,
        StepKind::Coding => true,
        StepKind::Linting => false,
        StepKind::InitialTesting => true,
        StepKind::Review => true,
        StepKind::PruneTests => false,
        StepKind::FinalReview => true,
    }
}

/// Mandatory kinds must remain present in every workflow and cannot be
/// skipped, split away, or removed.
pub fn is_mandatory(kind: StepKind) -> bool {
    matches!(kind, StepKind::Linting | StepKind::FinalReview)
}

/// The ten-step default workflow, all steps pending.
///
/// Installed when a story is claimed with an empty step list.
pub fn default_workflow() -> Vec<Step> {
    [
        (
            "step-001",
            StepKind::ContextGathering,
            "Explore the codebase, schemas, docs, and related code",
        ),
        (
            "step-002",
            StepKind::Planning,
            "Produce an implementation plan based on gathered context",
        ),
        (
            "step-003",
            StepKind::Architecture,
            "Design code structure and identify files to modify",
        ),
        (
            "step-004",
            StepKind::TestArchitecture,
            "Design test strategy and identify test files",
        ),
        ("step-005", StepKind::Coding, "Implement the changes"),
        ("step-006", StepKind::Linting, "Run formatters and lint checks"),
        (
            "step-007",
            StepKind::InitialTesting,
            "Run tests and identify failures",
        ),
        (
            "step-008",
            StepKind::Review,
            "Self-review against acceptance criteria",
        ),
        ("step-009", StepKind::PruneTests, "Remove redundant tests"),
        (
            "step-010",
            StepKind::FinalReview,
            "Final verification and commit",
        ),
    ]
    .into_iter()
    .map(|(id, kind, desc)| Step::new(id, kind, desc))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::StepStatus;

    #[test]
    fn test_default_workflow_shape() {
        let steps = default_workflow();
        assert_eq!(steps.len(), 10);
        assert_eq!(steps[0].id, "step-001");
        assert_eq!(steps[0].kind, StepKind::ContextGathering);
        assert_eq!(steps[9].id, "step-010");
        assert_eq!(steps[9].kind, StepKind::FinalReview);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_mandatory_kinds() {
        assert!(is_mandatory(StepKind::Linting));
        assert!(is_mandatory(StepKind::FinalReview));
        assert!(!is_mandatory(StepKind::Coding));
        assert!(!is_mandatory(StepKind::Review));
    }

    #[test]
    fn test_editing_permissions() {
        assert!(!allows_editing(StepKind::ContextGathering));
        assert!(!allows_editing(StepKind::Linting));
        assert!(!allows_editing(StepKind::PruneTests));
        assert!(allows_editing(StepKind::Planning));
        assert!(allows_editing(StepKind::Coding));
        assert!(allows_editing(StepKind::FinalReview));
    }

    #[test]
    fn test_timeout_table() {
        assert_eq!(step_timeout(StepKind::Coding), Duration::from_secs(1800));
        assert_eq!(step_timeout(StepKind::Linting), Duration::from_secs(300));
        assert_eq!(
            step_timeout(StepKind::FinalReview),
            Duration::from_secs(900)
        );
        // every kind falls inside the 5-30 minute band
        for kind in [
            StepKind::ContextGathering,
            StepKind::Planning,
            StepKind::Architecture,
            StepKind::TestArchitecture,
            StepKind::Coding,
            StepKind::Linting,
            StepKind::InitialTesting,
            StepKind::Review,
            StepKind::PruneTests,
            StepKind::FinalReview,
        ] {
            let t = step_timeout(kind);
            assert!(t >= Duration::from_secs(300) && t <= Duration::from_secs(1800));
        }
    }
}
