//! Command dispatch for the `weaver` binary.

pub mod run;
