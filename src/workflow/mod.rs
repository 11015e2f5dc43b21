//! The step-level workflow engine: data model, step-kind metadata, edit
//! guardrails, and prompt composition.

pub mod edit;
pub mod model;
pub mod prompt;
pub mod steps;
