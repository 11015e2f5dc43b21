//! Per-step instruction templates and prompt composition.
//!
//! Each step is a fresh agent invocation — no conversation state carries
//! over. The composed prompt is the whole context: story description and
//! acceptance criteria, the kind-specific instructions, the notes chain from
//! completed prior steps, and both scratch files.

use crate::workflow::model::{Step, StepKind, StepStatus, Story};
use crate::workflow::steps::allows_editing;

/// Kind-specific instruction template.
pub fn step_instructions(kind: StepKind) -> &'static str {
    match kind {
        StepKind::ContextGathering => {
            "## Step: Context Gathering\n\n\
             **You receive:** Story description, acceptance criteria, global scratch file, story scratch file.\n\
             **You produce:** Context summary listing: relevant files with paths, schemas, \
             existing patterns, related tests, current behavior.\n\n\
             ### Instructions\n\
             - Pure exploration — read code, grep for patterns, check models and schemas.\n\
             - Do NOT make decisions or plan. Just gather context.\n\
             - Write all findings to your story scratch file.\n\
             - Identify: target files, related models, existing test patterns, current behavior.\n\n\
             ### Exit Criteria\n\
             All areas relevant to the story are identified and documented.\n\n\
             End your response with a SUMMARY section (3-5 lines) capturing key findings."
        }
        StepKind::Planning => {
            "## Step: Planning\n\n\
             **You receive:** Notes from context_gathering, story acceptance criteria, scratch files.\n\
             **You produce:** Implementation plan: what to change, in what order, which approach, which files.\n\n\
             ### Instructions\n\
             - Focus on decision-making based on gathered context.\n\
             - If the story is more complex than a single coding round, use workflow editing to split/add steps.\n\
             - For simple stories, skip unnecessary steps (e.g., skip test_architecture for config-only work).\n\
             - Write the plan to your story scratch file.\n\n\
             ### Exit Criteria\n\
             Plan covers all acceptance criteria; files to modify are identified.\n\n\
             End your response with a SUMMARY section (3-5 lines)."
        }
        StepKind::Architecture => {
            "## Step: Architecture\n\n\
             **You receive:** Notes from context_gathering + planning, scratch files.\n\
             **You produce:** Architecture notes: new/modified files, schema changes, migration needs, \
             module dependencies, layer boundary compliance.\n\n\
             ### Instructions\n\
             - Design the technical structure.\n\
             - Verify it respects the project's layering conventions.\n\
             - If a migration is needed, note it explicitly.\n\
             - May add/split coding steps via workflow editing.\n\n\
             ### Exit Criteria\n\
             All structural decisions documented; module dependencies verified.\n\n\
             End your response with a SUMMARY section (3-5 lines)."
        }
        StepKind::TestArchitecture => {
            "## Step: Test Architecture\n\n\
             **You receive:** Notes from architecture, existing test patterns, scratch files.\n\
             **You produce:** Test plan: test files, test groups, key scenarios, fixtures needed, edge cases.\n\n\
             ### Instructions\n\
             - Design tests independently from implementation.\n\
             - Cover all acceptance criteria.\n\
             - Identify which fixtures exist and which need creation.\n\
             - Your test plan will be used by the coding step.\n\n\
             ### Exit Criteria\n\
             Test plan covers all acceptance criteria; fixture requirements identified.\n\n\
             End your response with a SUMMARY section (3-5 lines)."
        }
        StepKind::Coding => {
            "## Step: Coding\n\n\
             **You receive:** Notes from architecture + test_architecture, story scratch file.\n\
             **You produce:** Modified/created files committed to git.\n\n\
             ### Instructions\n\
             - Implement production code and tests according to the plans from prior steps.\n\
             - Commit your changes with a descriptive message.\n\
             - If you discover unexpected complexity, use workflow editing to add steps.\n\n\
             ### Exit Criteria\n\
             All planned changes implemented; code builds without error.\n\n\
             End your response with a SUMMARY section (3-5 lines)."
        }
        StepKind::Linting => {
            "## Step: Linting\n\n\
             **You receive:** Current codebase state.\n\
             **You produce:** Clean lint/format pass, fixes committed.\n\n\
             ### Instructions\n\
             - Run the project's formatter and lint suite.\n\
             - Fix any issues found.\n\
             - Re-run until clean.\n\
             - Commit fixes with message \"style: fix lint issues\".\n\n\
             ### Exit Criteria\n\
             The lint suite passes with zero issues.\n\n\
             End your response with a SUMMARY section (3-5 lines)."
        }
        StepKind::InitialTesting => {
            "## Step: Initial Testing\n\n\
             **You receive:** Notes from test_architecture, current codebase.\n\
             **You produce:** Test results with pass/fail per test, categorized failures if any.\n\n\
             ### Instructions\n\
             - Run the test suite for the affected areas.\n\
             - If tests fail, categorize root causes.\n\
             - Use workflow editing to add a coding -> linting -> initial_testing fix cycle if needed.\n\n\
             ### Exit Criteria\n\
             All relevant tests executed; failures documented with root causes.\n\n\
             End your response with a SUMMARY section (3-5 lines)."
        }
        StepKind::Review => {
            "## Step: Review\n\n\
             **You receive:** All prior step notes, acceptance criteria, test results, scratch files.\n\
             **You produce:** Review notes verifying each acceptance criterion with specific code references.\n\n\
             ### Instructions\n\
             - For each acceptance criterion, cite the specific file and line that implements it.\n\
             - If you cannot cite a specific location, the criterion is NOT met — flag it.\n\
             - Check error handling, edge cases, layer boundaries.\n\
             - If issues found, use workflow editing to add fix steps.\n\n\
             ### Exit Criteria\n\
             All acceptance criteria verified; no obvious issues remain.\n\n\
             End your response with a SUMMARY section (3-5 lines)."
        }
        StepKind::PruneTests => {
            "## Step: Prune Tests\n\n\
             **You receive:** Current test suite, all prior step notes.\n\
             **You produce:** Pruned test files committed.\n\n\
             ### Instructions\n\
             - Remove tests that duplicate coverage or test implementation details rather than behavior.\n\
             - Justify each removal.\n\
             - Do NOT remove tests that cover distinct edge cases or acceptance criteria.\n\
             - Commit removals.\n\n\
             ### Exit Criteria\n\
             No redundant tests remain; coverage of acceptance criteria preserved.\n\n\
             End your response with a SUMMARY section (3-5 lines)."
        }
        StepKind::FinalReview => {
            "## Step: Final Review\n\n\
             **You receive:** All prior step notes, full story context, scratch files.\n\
             **You produce:** Final verification that everything passes, clean final commit.\n\n\
             ### Instructions\n\
             - Run the lint suite and verify it passes.\n\
             - Run the tests and verify they pass.\n\
             - Verify ALL acceptance criteria are met — cite file and line for each.\n\
             - If issues found, add fix steps before this step via workflow editing; they will \
             run before this step re-executes.\n\
             - Create a clean final commit summarizing the story's changes.\n\n\
             ### Exit Criteria\n\
             All acceptance criteria pass; tests pass; lint passes; commit is clean.\n\n\
             End your response with a SUMMARY section (3-5 lines)."
        }
    }
}

/// Build the full prompt for one step invocation.
pub fn compose_step_prompt(
    story: &Story,
    step: &Step,
    global_scratch: &str,
    story_scratch: &str,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    // Story context
    parts.push(format!("# Story: {}", story.title));
    parts.push(format!("\n**Story ID:** {}", story.id));
    let description = if story.description.is_empty() {
        &story.title
    } else {
        &story.description
    };
    parts.push(format!("\n**Description:**\n{description}"));

    if !story.acceptance_criteria.is_empty() {
        parts.push("\n**Acceptance Criteria:**".to_string());
        for criterion in &story.acceptance_criteria {
            parts.push(format!("- {criterion}"));
        }
    }

    // Kind-specific instructions
    parts.push(format!("\n---\n\n{}", step_instructions(step.kind)));

    // The step's current description (may have been rewritten by edits)
    if !step.description.is_empty() {
        parts.push(format!("\n**Current step task:** {}", step.description));
    }

    // Notes chain from completed prior steps, in step-index order
    let prior_notes = collect_prior_notes(story, step);
    if !prior_notes.is_empty() {
        parts.push("\n---\n\n## Context from Prior Steps\n".to_string());
        parts.push(prior_notes);
    }

    // Scratch files
    if !global_scratch.trim().is_empty() {
        parts.push("\n---\n\n## Global Scratch (shared across stories)\n".to_string());
        parts.push(global_scratch.trim().to_string());
    }
    if !story_scratch.trim().is_empty() {
        parts.push(format!("\n---\n\n## Story Scratch ({})\n", story.id));
        parts.push(story_scratch.trim().to_string());
    }

    // Edit drop box trailer, only for kinds that may request edits
    if allows_editing(step.kind) {
        parts.push("\n---\n\n## Workflow Editing\n".to_string());
        parts.push(format!(
            "To modify remaining steps, write a JSON file to `edits/{}.json`.\n\
             Supported operations: add_after, split, skip, reorder, edit_description, restart.\n\
             Every operation requires a `reason`. See the step instructions above for when to use editing.",
            story.id
        ));
    }

    parts.join("\n")
}

fn collect_prior_notes(story: &Story, current: &Step) -> String {
    let mut lines: Vec<String> = Vec::new();
    for step in &story.steps {
        if step.id == current.id {
            break;
        }
        if step.status == StepStatus::Completed {
            if let Some(notes) = &step.notes {
                lines.push(format!("### {} ({})", step.kind, step.id));
                lines.push(notes.clone());
                lines.push(String::new());
            }
        }
    }
    lines.join("\n")
}
