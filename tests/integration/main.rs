//! Integration tests for the sync engine.

mod fixture;
mod github_tests;
mod sync_workflow;
mod vanilla_tests;
