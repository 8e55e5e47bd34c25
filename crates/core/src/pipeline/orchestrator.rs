//! # Pipeline Orchestrator
//!
//! Drives one invocation: evaluates every stage in topological order,
//! decides skip or execute against the checkpoint store, resolves inputs,
//! hands execution to the [`StageRunner`] and reports the outcome.
//!
//! ```text
//! Collect ──► Analyze ──► Adapt ──► Cluster ──► Strategize
//!   │            │          │          │            │
//!   └── evaluate: resume? forced? checkpoint? inputs newer? ──► skip | run
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::{EventBus, PipelineEvent, PipelineEventKind};
use super::manifest::{
    ExecuteReason, RunManifest, SkipReason, StageDecision, StageEntry, UnitScope,
};
use super::retry::RetryPolicy;
use super::runner::{Collaborators, StageInputs, StageOutput, StageRunner, UnitFailure};
use super::{Stage, StageState};
use crate::config::{PipelineConfig, RegenerationMode};
use crate::errors::{CheckpointError, PipelineError};
use crate::state::{Artifact, CheckpointStore};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    Succeeded,
    Failed { stage: Stage, reason: String },
    /// `stage` is the stage that was interrupted or about to start
    Cancelled { stage: Option<Stage> },
}

/// Final report of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageEntry>,
    /// Units left out of some stage's output; they do not fail the run
    pub unit_failures: Vec<UnitFailure>,
    pub outcome: RunOutcome,
    pub events: Vec<PipelineEvent>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// Process exit status for the outcome.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed { .. } => 1,
            RunOutcome::Cancelled { .. } => 130,
        }
    }

    pub fn state(&self, stage: Stage) -> StageState {
        self.stages
            .iter()
            .find(|entry| entry.stage == stage)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    /// Chats excluded from `stage`'s output.
    pub fn failed_chats(&self, stage: Stage) -> Vec<&str> {
        self.unit_failures
            .iter()
            .filter(|f| f.stage == stage)
            .filter_map(|f| f.chat_id.as_deref())
            .collect()
    }
}

/// One line of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStage {
    pub stage: Stage,
    pub decision: StageDecision,
}

pub struct Orchestrator {
    config: PipelineConfig,
    store: CheckpointStore,
    collaborators: Collaborators,
    events: EventBus,
    cancel: CancellationToken,
    retry: Option<RetryPolicy>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, store: CheckpointStore, collaborators: Collaborators) -> Self {
        Self {
            config,
            store,
            collaborators,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            retry: None,
        }
    }

    /// Forward events to a channel as they happen.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = EventBus::new(Some(tx));
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the retry policy built from the config.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn runner(&self) -> StageRunner {
        let runner = StageRunner::new(
            &self.config,
            self.store.clone(),
            self.collaborators.clone(),
            self.events.clone(),
            self.cancel.clone(),
        );
        match &self.retry {
            Some(retry) => runner.with_retry_policy(retry.clone()),
            None => runner,
        }
    }

    /// Run the pipeline up to the terminal stage.
    ///
    /// Stage failures and cancellation are reported through
    /// [`RunSummary::outcome`]. `Err` means the run could not be carried out
    /// at all: invalid configuration or a checkpoint storage failure.
    #[tracing::instrument(skip(self), fields(terminal = %self.config.terminal_stage))]
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        self.config.validate()?;

        let mut manifest = RunManifest::new();
        let runner = self.runner();
        let mut unit_failures = Vec::new();
        let mut outcome = RunOutcome::Succeeded;

        tracing::info!(run_id = %manifest.run_id, "Pipeline run started");
        self.events.emit(
            PipelineEvent::new(PipelineEventKind::RunStarted)
                .with_data(serde_json::json!({ "run_id": manifest.run_id })),
        );

        for stage in Stage::ALL {
            if stage > self.config.terminal_stage {
                manifest.decide(stage, StageDecision::BeyondTerminal);
            }
        }

        for stage in Stage::ALL {
            if stage > self.config.terminal_stage {
                break;
            }
            if self.cancel.is_cancelled() {
                outcome = RunOutcome::Cancelled { stage: Some(stage) };
                break;
            }

            let decision = self.evaluate(stage)?;
            tracing::info!(stage = %stage, decision = %decision, "Stage evaluated");
            manifest.decide(stage, decision.clone());

            let (reason, scope) = match decision {
                StageDecision::Execute { reason, scope } => (reason, scope),
                StageDecision::Skip { reason } => {
                    manifest.transition(stage, StageState::Skipped)?;
                    self.events.emit(
                        PipelineEvent::for_stage(PipelineEventKind::StageSkipped, stage)
                            .with_data(serde_json::json!({ "reason": reason.to_string() })),
                    );
                    continue;
                }
                StageDecision::BeyondTerminal => continue,
            };

            manifest.transition(stage, StageState::Running)?;
            self.events.emit(
                PipelineEvent::for_stage(PipelineEventKind::StageStarted, stage)
                    .with_data(serde_json::json!({ "reason": reason.to_string() })),
            );

            let trusted = reason == ExecuteReason::ResumePoint;
            let inputs = self.resolve_inputs(stage, trusted)?;

            let output = match runner.run_stage(stage, &inputs, &scope).await {
                Ok(output) => output,
                Err(PipelineError::Cancelled) => {
                    manifest.fail(stage, "cancelled")?;
                    self.stage_failed(stage, "cancelled");
                    outcome = RunOutcome::Cancelled { stage: Some(stage) };
                    break;
                }
                Err(e @ PipelineError::MissingInput { .. }) => {
                    let reason = e.to_string();
                    manifest.fail(stage, &reason)?;
                    self.stage_failed(stage, &reason);
                    outcome = RunOutcome::Failed { stage, reason };
                    break;
                }
                Err(e) => return Err(e),
            };

            unit_failures.extend(output.failures.iter().cloned());
            let entry = manifest.entry_mut(stage);
            entry.artifacts_written = output.written.len();
            entry.units_reused = output.unchanged.len() + reused_units(stage, &inputs, &scope);

            if let Some(reason) = self.missing_mandatory_output(stage, &output, trusted)? {
                manifest.fail(stage, &reason)?;
                self.stage_failed(stage, &reason);
                outcome = RunOutcome::Failed { stage, reason };
                break;
            }

            manifest.transition(stage, StageState::Done)?;
            self.events.emit(
                PipelineEvent::for_stage(PipelineEventKind::StageCompleted, stage).with_data(
                    serde_json::json!({
                        "written": output.written.len(),
                        "unchanged": output.unchanged.len(),
                        "retired": output.retired.len(),
                        "failed": output.failures.len(),
                    }),
                ),
            );
        }

        let kind = match &outcome {
            RunOutcome::Succeeded => {
                tracing::info!(
                    run_id = %manifest.run_id,
                    unit_failures = unit_failures.len(),
                    "Pipeline run completed"
                );
                PipelineEventKind::RunCompleted
            }
            RunOutcome::Failed { stage, reason } => {
                tracing::error!(stage = %stage, reason = %reason, "Pipeline run failed");
                PipelineEventKind::RunFailed
            }
            RunOutcome::Cancelled { stage } => {
                tracing::warn!(stage = ?stage, "Pipeline run cancelled");
                PipelineEventKind::RunCancelled
            }
        };
        self.events.emit(
            PipelineEvent::new(kind).with_data(serde_json::json!({ "run_id": manifest.run_id })),
        );

        Ok(RunSummary {
            run_id: manifest.run_id.clone(),
            started_at: manifest.started_at,
            finished_at: Utc::now(),
            stages: manifest.entries().to_vec(),
            unit_failures,
            outcome,
            events: self.events.snapshot(),
        })
    }

    /// Predict the decision for every stage without executing anything.
    pub fn plan(&self) -> Result<Vec<PlannedStage>, PipelineError> {
        self.config.validate()?;

        let mut planned: Vec<PlannedStage> = Vec::new();
        for stage in Stage::ALL {
            let decision = if stage > self.config.terminal_stage {
                StageDecision::BeyondTerminal
            } else {
                let decision = self.evaluate(stage)?;
                let upstream_runs = planned
                    .iter()
                    .any(|p| stage.inputs().contains(&p.stage) && p.decision.will_execute());
                match decision {
                    StageDecision::Skip {
                        reason: SkipReason::CheckpointValid,
                    } if upstream_runs => StageDecision::execute(ExecuteReason::UpstreamWillRun),
                    other => other,
                }
            };
            planned.push(PlannedStage { stage, decision });
        }
        Ok(planned)
    }

    fn stage_failed(&self, stage: Stage, reason: &str) {
        self.events.emit(
            PipelineEvent::for_stage(PipelineEventKind::StageFailed, stage)
                .with_data(serde_json::json!({ "reason": reason })),
        );
    }

    /// Skip or execute `stage`, given the checkpoints as they are now.
    fn evaluate(&self, stage: Stage) -> Result<StageDecision, PipelineError> {
        if let Some(resume) = self.config.resume_from {
            if stage < resume {
                return Ok(StageDecision::Skip {
                    reason: SkipReason::TrustedByResume,
                });
            }
            if stage == resume {
                return Ok(StageDecision::execute(ExecuteReason::ResumePoint));
            }
        }
        if self.config.force_regenerate.contains(&stage) {
            return Ok(StageDecision::execute(ExecuteReason::Forced));
        }

        let valid = StageDecision::Skip {
            reason: SkipReason::CheckpointValid,
        };

        match stage {
            Stage::Collect => {
                if self.store.list_chat_ids(Stage::Collect)?.is_empty() {
                    Ok(StageDecision::execute(ExecuteReason::NoCheckpoint))
                } else {
                    Ok(valid)
                }
            }
            Stage::Analyze => {
                let collected = self.collected_chats()?;
                let analyzed = self.store.latest_per_chat(Stage::Analyze)?;
                if collected.is_empty() {
                    return Ok(StageDecision::execute(ExecuteReason::NoCheckpoint));
                }

                let stale: BTreeSet<String> = collected
                    .iter()
                    .filter(|(chat_id, collect)| {
                        analyzed
                            .get(*chat_id)
                            .map_or(true, |analysis| collect.is_newer_than(analysis))
                    })
                    .map(|(chat_id, _)| chat_id.clone())
                    .collect();

                if stale.is_empty() {
                    return Ok(valid);
                }
                tracing::debug!(stale = stale.len(), total = collected.len(), "Stale chats found");
                Ok(match self.config.regeneration_mode {
                    RegenerationMode::MissingOnly => StageDecision::Execute {
                        reason: ExecuteReason::MissingChats,
                        scope: UnitScope::Chats(stale),
                    },
                    RegenerationMode::Full => StageDecision::execute(ExecuteReason::StaleChats),
                })
            }
            Stage::Adapt | Stage::Cluster | Stage::Strategize => {
                let current = match self.store.get(stage, None) {
                    Ok(artifact) => artifact,
                    Err(e) if e.is_not_found() => {
                        return Ok(StageDecision::execute(ExecuteReason::NoCheckpoint))
                    }
                    Err(e) => return Err(e.into()),
                };

                let inputs = self.resolve_inputs(stage, false)?;
                let upstream_newer = stage.inputs().iter().any(|input| {
                    inputs
                        .artifacts(*input)
                        .iter()
                        .any(|artifact| artifact.is_newer_than(&current))
                });
                if upstream_newer {
                    return Ok(StageDecision::execute(ExecuteReason::UpstreamNewer));
                }

                if stage == Stage::Adapt {
                    let included: BTreeSet<String> = inputs
                        .artifacts(Stage::Analyze)
                        .iter()
                        .filter_map(|a| a.source_chat_id.clone())
                        .collect();
                    if included != current.as_adapt()?.chat_ids {
                        return Ok(StageDecision::execute(ExecuteReason::UpstreamChanged));
                    }
                }
                Ok(valid)
            }
        }
    }

    /// Latest checkpoints of every input of `stage`. Missing inputs are left
    /// empty; the runner rejects them.
    fn resolve_inputs(&self, stage: Stage, trusted: bool) -> Result<StageInputs, PipelineError> {
        let mut inputs = StageInputs::new();
        for input in stage.inputs() {
            let artifacts = match input {
                Stage::Collect => self.collected_chats()?.into_values().collect(),
                Stage::Analyze => self.current_analyses(trusted)?.into_values().collect(),
                aggregate => latest(&self.store, *aggregate)?.into_iter().collect(),
            };
            inputs.insert(*input, artifacts);
        }
        Ok(inputs)
    }

    /// Latest Collect checkpoint of every chat that is not retired.
    fn collected_chats(&self) -> Result<BTreeMap<String, Artifact>, PipelineError> {
        Ok(self
            .store
            .latest_per_chat(Stage::Collect)?
            .into_iter()
            .filter(|(_, artifact)| artifact.as_collect().is_ok_and(|p| !p.is_retired()))
            .collect())
    }

    /// Analyses at least as new as their chat's collected messages. When
    /// `trusted`, every stored analysis counts except those of retired chats.
    fn current_analyses(&self, trusted: bool) -> Result<BTreeMap<String, Artifact>, PipelineError> {
        let analyzed = self.store.latest_per_chat(Stage::Analyze)?;
        let collected = self.store.latest_per_chat(Stage::Collect)?;
        Ok(analyzed
            .into_iter()
            .filter(|(chat_id, analysis)| match collected.get(chat_id) {
                Some(collect) if collect.as_collect().map_or(true, |p| p.is_retired()) => false,
                Some(collect) => trusted || !collect.is_newer_than(analysis),
                None => trusted,
            })
            .collect())
    }

    /// Why the stage must count as failed, if its mandatory output is absent.
    fn missing_mandatory_output(
        &self,
        stage: Stage,
        output: &StageOutput,
        trusted: bool,
    ) -> Result<Option<String>, PipelineError> {
        let first_reason = || {
            output
                .failures
                .first()
                .map(|f| f.reason.clone())
                .unwrap_or_else(|| "no output produced".to_string())
        };

        let reason = match stage {
            Stage::Collect if output.produced() == 0 => {
                Some(format!("no chats collected: {}", first_reason()))
            }
            Stage::Analyze if self.current_analyses(trusted)?.is_empty() => {
                Some(format!("no chat could be analysed: {}", first_reason()))
            }
            Stage::Adapt | Stage::Cluster | Stage::Strategize if output.written.is_empty() => {
                Some(first_reason())
            }
            _ => None,
        };
        Ok(reason)
    }
}

fn latest(store: &CheckpointStore, stage: Stage) -> Result<Option<Artifact>, CheckpointError> {
    match store.get(stage, None) {
        Ok(artifact) => Ok(Some(artifact)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Per-chat units outside a restricted scope keep their checkpoint.
fn reused_units(stage: Stage, inputs: &StageInputs, scope: &UnitScope) -> usize {
    match (stage, scope) {
        (Stage::Analyze, UnitScope::Chats(_)) => inputs
            .artifacts(Stage::Collect)
            .iter()
            .filter_map(|a| a.source_chat_id.as_deref())
            .filter(|chat_id| !scope.includes(chat_id))
            .count(),
        _ => 0,
    }
}
