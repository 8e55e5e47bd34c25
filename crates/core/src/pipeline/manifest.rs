//! # Run Manifest
//!
//! Per-run record of what the orchestrator decided for every stage and the
//! state each stage reached. All state changes go through
//! [`RunManifest::transition`], which rejects moves the stage state machine
//! does not allow.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Stage, StageState};
use crate::errors::PipelineError;

/// Why a stage has to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteReason {
    NoCheckpoint,
    Forced,
    ResumePoint,
    /// An input artifact is newer than the stage checkpoint
    UpstreamNewer,
    /// The set of chats feeding the stage changed
    UpstreamChanged,
    /// Some collected chats have no current analysis
    MissingChats,
    /// `full` mode: at least one chat is stale, so every chat runs
    StaleChats,
    /// Only used by `plan()`: an upstream stage is predicted to run
    UpstreamWillRun,
}

impl fmt::Display for ExecuteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExecuteReason::NoCheckpoint => "no checkpoint",
            ExecuteReason::Forced => "forced regeneration",
            ExecuteReason::ResumePoint => "resume point",
            ExecuteReason::UpstreamNewer => "input newer than checkpoint",
            ExecuteReason::UpstreamChanged => "input chats changed",
            ExecuteReason::MissingChats => "chats without current analysis",
            ExecuteReason::StaleChats => "stale chats, full regeneration",
            ExecuteReason::UpstreamWillRun => "upstream stage will run",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CheckpointValid,
    /// Before `resume_from`; checkpoints trusted without checks
    TrustedByResume,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::CheckpointValid => f.write_str("checkpoint valid"),
            SkipReason::TrustedByResume => f.write_str("trusted by resume"),
        }
    }
}

/// Which units of a per-chat stage execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitScope {
    All,
    Chats(BTreeSet<String>),
}

impl UnitScope {
    pub fn includes(&self, chat_id: &str) -> bool {
        match self {
            UnitScope::All => true,
            UnitScope::Chats(chats) => chats.contains(chat_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum StageDecision {
    Skip { reason: SkipReason },
    Execute { reason: ExecuteReason, scope: UnitScope },
    /// After `terminal_stage`; left untouched this run
    BeyondTerminal,
}

impl StageDecision {
    pub fn execute(reason: ExecuteReason) -> Self {
        StageDecision::Execute {
            reason,
            scope: UnitScope::All,
        }
    }

    pub fn will_execute(&self) -> bool {
        matches!(self, StageDecision::Execute { .. })
    }
}

impl fmt::Display for StageDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageDecision::Skip { reason } => write!(f, "skip ({})", reason),
            StageDecision::Execute {
                reason,
                scope: UnitScope::All,
            } => write!(f, "run ({})", reason),
            StageDecision::Execute {
                reason,
                scope: UnitScope::Chats(chats),
            } => write!(f, "run {} chat(s) ({})", chats.len(), reason),
            StageDecision::BeyondTerminal => f.write_str("beyond terminal stage"),
        }
    }
}

/// One stage's line in the run manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: Stage,
    pub state: StageState,
    pub decision: Option<StageDecision>,
    /// Failure reason or other free-form note
    pub note: Option<String>,
    pub artifacts_written: usize,
    /// Per-chat units whose checkpoint was kept as it was
    pub units_reused: usize,
}

impl StageEntry {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            state: StageState::Pending,
            decision: None,
            note: None,
            artifacts_written: 0,
            units_reused: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    entries: Vec<StageEntry>,
}

impl Default for RunManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl RunManifest {
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            entries: Stage::ALL.into_iter().map(StageEntry::new).collect(),
        }
    }

    pub fn entries(&self) -> &[StageEntry] {
        &self.entries
    }

    pub fn entry(&self, stage: Stage) -> &StageEntry {
        &self.entries[stage_index(stage)]
    }

    pub fn entry_mut(&mut self, stage: Stage) -> &mut StageEntry {
        &mut self.entries[stage_index(stage)]
    }

    pub fn state(&self, stage: Stage) -> StageState {
        self.entry(stage).state
    }

    pub fn decide(&mut self, stage: Stage, decision: StageDecision) {
        self.entry_mut(stage).decision = Some(decision);
    }

    /// Move a stage to `to`, refusing transitions the state machine forbids.
    pub fn transition(&mut self, stage: Stage, to: StageState) -> Result<(), PipelineError> {
        let entry = self.entry_mut(stage);
        if !entry.state.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                stage,
                from: entry.state,
                to,
            });
        }
        tracing::debug!(stage = %stage, from = entry.state.as_str(), to = to.as_str(), "Stage transition");
        entry.state = to;
        Ok(())
    }

    pub fn fail(&mut self, stage: Stage, reason: impl Into<String>) -> Result<(), PipelineError> {
        self.transition(stage, StageState::Failed)?;
        self.entry_mut(stage).note = Some(reason.into());
        Ok(())
    }
}

fn stage_index(stage: Stage) -> usize {
    Stage::ALL
        .iter()
        .position(|s| *s == stage)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_starts_pending() {
        let manifest = RunManifest::new();
        assert_eq!(manifest.entries().len(), 5);
        assert!(manifest
            .entries()
            .iter()
            .all(|e| e.state == StageState::Pending && e.decision.is_none()));
    }

    #[test]
    fn test_legal_transitions() {
        let mut manifest = RunManifest::new();
        manifest.transition(Stage::Collect, StageState::Skipped).unwrap();
        manifest.transition(Stage::Analyze, StageState::Running).unwrap();
        manifest.transition(Stage::Analyze, StageState::Done).unwrap();
        manifest.transition(Stage::Adapt, StageState::Running).unwrap();
        manifest.fail(Stage::Adapt, "no analyses").unwrap();

        assert_eq!(manifest.state(Stage::Collect), StageState::Skipped);
        assert_eq!(manifest.state(Stage::Analyze), StageState::Done);
        assert_eq!(manifest.entry(Stage::Adapt).note.as_deref(), Some("no analyses"));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut manifest = RunManifest::new();
        let err = manifest
            .transition(Stage::Cluster, StageState::Done)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                stage: Stage::Cluster,
                from: StageState::Pending,
                to: StageState::Done,
            }
        ));

        manifest.transition(Stage::Collect, StageState::Skipped).unwrap();
        assert!(manifest
            .transition(Stage::Collect, StageState::Running)
            .is_err());
    }

    #[test]
    fn test_unit_scope() {
        let scope = UnitScope::Chats(["a".to_string()].into_iter().collect());
        assert!(scope.includes("a"));
        assert!(!scope.includes("b"));
        assert!(UnitScope::All.includes("b"));
    }

    #[test]
    fn test_decision_display() {
        let decision = StageDecision::Execute {
            reason: ExecuteReason::MissingChats,
            scope: UnitScope::Chats(["a".to_string(), "b".to_string()].into_iter().collect()),
        };
        assert_eq!(decision.to_string(), "run 2 chat(s) (chats without current analysis)");
        assert_eq!(
            StageDecision::Skip {
                reason: SkipReason::TrustedByResume
            }
            .to_string(),
            "skip (trusted by resume)"
        );
    }
}
