//! # Pipeline
//!
//! Resumable five-stage analysis pipeline.
//!
//! ## Modules
//!
//! - `stage` - Stage identifiers and the per-stage state machine
//! - `retry` - The one retry policy used for every collaborator call
//! - `events` - Typed lifecycle events
//! - `manifest` - Per-run skip/execute decisions and stage states
//! - `runner` - Executes a single stage over resolved inputs
//! - `orchestrator` - Decides what runs and drives the stages in order

pub mod events;
pub mod manifest;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod stage;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{EventBus, PipelineEvent, PipelineEventKind};
pub use manifest::{
    ExecuteReason, RunManifest, SkipReason, StageDecision, StageEntry, UnitScope,
};
pub use orchestrator::{Orchestrator, PlannedStage, RunOutcome, RunSummary};
pub use retry::{RetryError, RetryPolicy};
pub use runner::{
    Collaborators, FailureKind, StageInputs, StageOutput, StageRunner, UnitFailure,
};
pub use stage::{Granularity, Stage, StageState};
