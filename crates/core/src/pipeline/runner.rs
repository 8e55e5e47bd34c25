//! # Stage Runner
//!
//! Executes exactly one stage over its resolved inputs. Every collaborator
//! call goes through the run's [`RetryPolicy`]; a unit of work that still
//! fails is recorded and left out of the output while its siblings carry on.
//!
//! Analyze fans out over chats with a bounded worker pool:
//!
//! ```text
//! collect artifacts ──► Semaphore(max_workers) ──► JoinSet
//!                                                   ├─ chat a: retry(analyze) ─► put
//!                                                   ├─ chat b: retry(analyze) ─► put
//!                                                   └─ chat c: exhausted ───────► UnitFailure
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::events::{EventBus, PipelineEvent, PipelineEventKind};
use super::manifest::UnitScope;
use super::retry::{RetryError, RetryPolicy};
use super::Stage;
use crate::config::PipelineConfig;
use crate::errors::{CheckpointError, PipelineError, ServiceError};
use crate::services::{
    AnalysisRequest, AnalysisService, ChatAnalysis, ClusteringService, MessageSource,
    StrategyRequest,
};
use crate::skills::{EmbeddingClusterer, LlmAnalysisService, OpenAiEmbeddings};
use crate::state::{
    AnalyzePayload, Artifact, CheckpointStore, ClusterPayload, CollectPayload, StagePayload,
    StrategizePayload,
};
use crate::tools::collector::DirectoryMessageSource;
use crate::tools::topics::{build_adapt, distinct_topic_names, group_clusters};
use crate::tools::transcript::{prepare_messages, PrepareOptions};

/// External services the runner delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn MessageSource>,
    pub analysis: Arc<dyn AnalysisService>,
    pub clustering: Arc<dyn ClusteringService>,
}

impl Collaborators {
    /// Directory source, LLM analysis and OpenAI-compatible embeddings.
    pub fn live(config: &PipelineConfig) -> Self {
        let embeddings =
            OpenAiEmbeddings::new(&config.embedding_base_url, &config.embedding_model);
        Self {
            source: Arc::new(DirectoryMessageSource::new(&config.chat_source_dir)),
            analysis: Arc::new(LlmAnalysisService::new(
                config.analysis_model.clone(),
                config.strategy_model.clone(),
                config.max_chunk_chars,
            )),
            clustering: Arc::new(EmbeddingClusterer::new(embeddings)),
        }
    }
}

/// Resolved input artifacts, keyed by the stage that produced them.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    artifacts: BTreeMap<Stage, Vec<Artifact>>,
}

impl StageInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stage: Stage, artifacts: Vec<Artifact>) {
        self.artifacts.insert(stage, artifacts);
    }

    pub fn artifacts(&self, stage: Stage) -> &[Artifact] {
        self.artifacts
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn single(&self, stage: Stage) -> Option<&Artifact> {
        self.artifacts(stage).first()
    }

    /// Every input of `stage` must carry at least one artifact.
    pub fn check(&self, stage: Stage) -> Result<(), PipelineError> {
        match stage
            .inputs()
            .iter()
            .find(|input| self.artifacts(**input).is_empty())
        {
            Some(input) => Err(PipelineError::MissingInput {
                stage,
                input: *input,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failures until the attempt budget ran out
    Exhausted,
    /// Non-retryable failure
    Permanent,
    /// Nothing to work on (e.g. a chat without messages)
    Empty,
}

/// A unit of work left out of a stage's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub stage: Stage,
    pub chat_id: Option<String>,
    pub reason: String,
    pub attempts: u32,
    pub kind: FailureKind,
}

impl UnitFailure {
    fn new(stage: Stage, chat_id: Option<&str>, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            stage,
            chat_id: chat_id.map(str::to_string),
            reason: reason.into(),
            attempts: 0,
            kind,
        }
    }

    /// `None` when the retry loop was cancelled; cancellation is not a unit failure.
    fn from_retry(stage: Stage, chat_id: Option<&str>, error: RetryError) -> Option<Self> {
        let (kind, attempts, reason) = match error {
            RetryError::Exhausted { attempts, error } => {
                (FailureKind::Exhausted, attempts, error.to_string())
            }
            RetryError::Permanent { attempts, error } => {
                (FailureKind::Permanent, attempts, error.to_string())
            }
            RetryError::Cancelled { .. } => return None,
        };
        Some(Self {
            stage,
            chat_id: chat_id.map(str::to_string),
            reason,
            attempts,
            kind,
        })
    }
}

/// What one stage execution produced.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Artifacts written by this execution
    pub written: Vec<Artifact>,
    /// Chats whose existing checkpoint already matched the fresh output
    pub unchanged: Vec<String>,
    /// Chats that were emptied or removed at the source
    pub retired: Vec<String>,
    pub failures: Vec<UnitFailure>,
}

impl StageOutput {
    /// Units with a valid output after this execution.
    pub fn produced(&self) -> usize {
        self.written.len() + self.unchanged.len()
    }
}

enum UnitOutcome {
    Written(Artifact),
    Failed(UnitFailure),
    Cancelled,
}

pub struct StageRunner {
    collaborators: Collaborators,
    store: CheckpointStore,
    retry: RetryPolicy,
    max_workers: usize,
    prepare: PrepareOptions,
    cluster_count: usize,
    user_name: String,
    events: EventBus,
    cancel: CancellationToken,
}

impl StageRunner {
    pub fn new(
        config: &PipelineConfig,
        store: CheckpointStore,
        collaborators: Collaborators,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            collaborators,
            store,
            retry: config.retry_policy(),
            max_workers: config.max_concurrent_chat_workers.max(1),
            prepare: config.prepare_options(),
            cluster_count: config.cluster_count.max(1),
            user_name: config.user_name.clone(),
            events,
            cancel,
        }
    }

    /// Replace the retry policy derived from the config.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute `stage`. `scope` restricts per-chat stages to some chats;
    /// aggregate stages ignore it.
    ///
    /// Unit failures are returned in the output. Errors are reserved for
    /// cancellation, a missing input and checkpoint storage failures.
    #[tracing::instrument(skip_all, fields(stage = %stage))]
    pub async fn run_stage(
        &self,
        stage: Stage,
        inputs: &StageInputs,
        scope: &UnitScope,
    ) -> Result<StageOutput, PipelineError> {
        inputs.check(stage)?;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let output = match stage {
            Stage::Collect => self.collect(scope).await?,
            Stage::Analyze => self.analyze(inputs, scope).await?,
            Stage::Adapt => self.adapt(inputs)?,
            Stage::Cluster => self.cluster(inputs).await?,
            Stage::Strategize => self.strategize(inputs).await?,
        };

        tracing::info!(
            written = output.written.len(),
            unchanged = output.unchanged.len(),
            failed = output.failures.len(),
            "Stage executed"
        );
        Ok(output)
    }

    fn unit_started(&self, stage: Stage, chat_id: Option<&str>) {
        self.events.emit(unit_event(PipelineEventKind::UnitStarted, stage, chat_id));
    }

    fn unit_completed(&self, stage: Stage, chat_id: Option<&str>) {
        self.events
            .emit(unit_event(PipelineEventKind::UnitCompleted, stage, chat_id));
    }

    fn unit_failed(&self, failure: UnitFailure, output: &mut StageOutput) {
        record_failure(&self.events, &failure);
        output.failures.push(failure);
    }

    async fn collect(&self, scope: &UnitScope) -> Result<StageOutput, PipelineError> {
        let stage = Stage::Collect;
        let mut output = StageOutput::default();
        let source = self.collaborators.source.as_ref();

        let listed = retry_unit(&self.retry, &self.cancel, &self.events, stage, None, |_| {
            source.list_chats()
        })
        .await;
        let chat_ids = match listed {
            Ok(ids) => ids,
            Err(e) if e.is_cancelled() => return Err(PipelineError::Cancelled),
            Err(e) => {
                if let Some(failure) = UnitFailure::from_retry(stage, None, e) {
                    self.unit_failed(failure, &mut output);
                }
                return Ok(output);
            }
        };

        for chat_id in chat_ids.iter().filter(|id| scope.includes(id)) {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            self.unit_started(stage, Some(chat_id));

            let loaded = retry_unit(
                &self.retry,
                &self.cancel,
                &self.events,
                stage,
                Some(chat_id),
                |_| source.load_chat(chat_id),
            )
            .await;
            let chat = match loaded {
                Ok(chat) => chat,
                Err(e) if e.is_cancelled() => return Err(PipelineError::Cancelled),
                Err(e) => {
                    if let Some(failure) = UnitFailure::from_retry(stage, Some(chat_id), e) {
                        self.unit_failed(failure, &mut output);
                    }
                    continue;
                }
            };

            if chat.messages.is_empty() {
                self.retire(chat_id, &mut output)?;
                self.unit_failed(
                    UnitFailure::new(stage, Some(chat_id), FailureKind::Empty, "chat has no messages"),
                    &mut output,
                );
                continue;
            }

            let payload = CollectPayload {
                chat_id: chat_id.clone(),
                title: chat.title,
                messages: chat.messages,
            };
            if let Ok(existing) = self.store.get(stage, Some(chat_id)) {
                if matches!(&existing.payload, StagePayload::Collect(p) if *p == payload) {
                    tracing::debug!(chat_id = %chat_id, "Collected chat unchanged");
                    output.unchanged.push(chat_id.clone());
                    self.unit_completed(stage, Some(chat_id));
                    continue;
                }
            }

            let artifact = self.store.put(StagePayload::Collect(payload), Some(chat_id))?;
            output.written.push(artifact);
            self.unit_completed(stage, Some(chat_id));
        }

        // A full listing is authoritative: checkpointed chats missing from it are gone
        if *scope == UnitScope::All {
            for chat_id in self.store.list_chat_ids(stage)? {
                if !chat_ids.contains(&chat_id) {
                    self.retire(&chat_id, &mut output)?;
                }
            }
        }

        Ok(output)
    }

    /// Supersede a chat's Collect checkpoint with a retired marker, so its
    /// older messages and analysis stop counting.
    fn retire(&self, chat_id: &str, output: &mut StageOutput) -> Result<(), PipelineError> {
        match self.store.get(Stage::Collect, Some(chat_id)) {
            Ok(existing) if existing.as_collect()?.is_retired() => return Ok(()),
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.store.put(
            StagePayload::Collect(CollectPayload::retired(chat_id)),
            Some(chat_id),
        )?;
        tracing::info!(chat_id = %chat_id, "Chat retired");
        output.retired.push(chat_id.to_string());
        Ok(())
    }

    async fn analyze(
        &self,
        inputs: &StageInputs,
        scope: &UnitScope,
    ) -> Result<StageOutput, PipelineError> {
        let stage = Stage::Analyze;
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut join_set = JoinSet::new();

        for artifact in inputs.artifacts(Stage::Collect) {
            let collected = artifact.as_collect()?;
            if collected.is_retired() || !scope.includes(&collected.chat_id) {
                continue;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::StageFatal {
                    stage,
                    reason: format!("worker pool closed: {}", e),
                })?;

            let chat_id = collected.chat_id.clone();
            let lines = prepare_messages(&collected.messages, &self.prepare);
            let analysis = Arc::clone(&self.collaborators.analysis);
            let store = self.store.clone();
            let retry = self.retry.clone();
            let events = self.events.clone();
            let cancel = self.cancel.clone();

            join_set.spawn(async move {
                let _permit = permit; // Hold permit until the chat is done
                let outcome = analyze_chat(
                    chat_id.clone(),
                    lines,
                    analysis.as_ref(),
                    &store,
                    &retry,
                    &events,
                    &cancel,
                )
                .await;
                (chat_id, outcome)
            });
        }

        let mut output = StageOutput::default();
        let mut storage_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(UnitOutcome::Written(artifact)))) => output.written.push(artifact),
                Ok((_, Ok(UnitOutcome::Failed(failure)))) => output.failures.push(failure),
                Ok((_, Ok(UnitOutcome::Cancelled))) => {}
                Ok((chat_id, Err(e))) => {
                    tracing::error!(chat_id = %chat_id, error = %e, "Failed to store analysis");
                    storage_error.get_or_insert(e);
                }
                Err(e) => {
                    let failure = UnitFailure::new(
                        stage,
                        None,
                        FailureKind::Permanent,
                        format!("analysis task panicked: {}", e),
                    );
                    record_failure(&self.events, &failure);
                    output.failures.push(failure);
                }
            }
        }

        if let Some(e) = storage_error {
            return Err(e.into());
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(output)
    }

    fn adapt(&self, inputs: &StageInputs) -> Result<StageOutput, PipelineError> {
        let stage = Stage::Adapt;
        let mut output = StageOutput::default();
        self.unit_started(stage, None);

        let analyses = inputs
            .artifacts(Stage::Analyze)
            .iter()
            .map(|artifact| {
                let analyzed = artifact.as_analyze()?;
                Ok((analyzed.chat_id.clone(), analyzed.analysis.clone()))
            })
            .collect::<Result<BTreeMap<String, ChatAnalysis>, PipelineError>>()?;

        let payload = build_adapt(&analyses);
        tracing::debug!(
            chats = payload.total_chats,
            topics = payload.total_topics,
            aggregated = payload.aggregated.len(),
            "Merged analyses"
        );
        output
            .written
            .push(self.store.put(StagePayload::Adapt(payload), None)?);
        self.unit_completed(stage, None);
        Ok(output)
    }

    async fn cluster(&self, inputs: &StageInputs) -> Result<StageOutput, PipelineError> {
        let stage = Stage::Cluster;
        let mut output = StageOutput::default();
        let adapt = required(inputs, stage, Stage::Adapt)?.as_adapt()?;

        let names = distinct_topic_names(&adapt.topics);
        if names.is_empty() {
            self.unit_failed(
                UnitFailure::new(stage, None, FailureKind::Empty, "no topics to cluster"),
                &mut output,
            );
            return Ok(output);
        }
        let k = self.cluster_count.min(names.len());

        self.unit_started(stage, None);
        let clustering = self.collaborators.clustering.as_ref();
        let names_ref = names.as_slice();
        let result = retry_unit(&self.retry, &self.cancel, &self.events, stage, None, |_| {
            clustering.cluster(names_ref, k)
        })
        .await;

        let clustering = match result {
            Ok(clustering) => clustering,
            Err(e) if e.is_cancelled() => return Err(PipelineError::Cancelled),
            Err(e) => {
                if let Some(failure) = UnitFailure::from_retry(stage, None, e) {
                    self.unit_failed(failure, &mut output);
                }
                return Ok(output);
            }
        };

        if clustering.assignments.len() != names.len() {
            let error = ServiceError::InvalidResponse(format!(
                "{} assignments for {} topics",
                clustering.assignments.len(),
                names.len()
            ));
            self.unit_failed(
                UnitFailure::new(stage, None, FailureKind::Permanent, error.to_string()),
                &mut output,
            );
            return Ok(output);
        }

        let clusters = group_clusters(&names, &clustering.assignments, &adapt.topics);
        let payload = ClusterPayload {
            k: clusters.len(),
            dimensions: clustering.vectors.first().map(Vec::len).unwrap_or_default(),
            clusters,
        };
        output
            .written
            .push(self.store.put(StagePayload::Cluster(payload), None)?);
        self.unit_completed(stage, None);
        Ok(output)
    }

    async fn strategize(&self, inputs: &StageInputs) -> Result<StageOutput, PipelineError> {
        let stage = Stage::Strategize;
        let mut output = StageOutput::default();
        let adapt = required(inputs, stage, Stage::Adapt)?.as_adapt()?;
        let clusters = required(inputs, stage, Stage::Cluster)?.as_cluster()?;

        let request = StrategyRequest {
            user_name: self.user_name.clone(),
            topics: adapt.aggregated.clone(),
            clusters: clusters.clusters.clone(),
            sentiment: adapt.sentiment.clone(),
            monetization_hints: adapt.monetization_hints.clone(),
        };

        self.unit_started(stage, None);
        let analysis = self.collaborators.analysis.as_ref();
        let request_ref = &request;
        let result = retry_unit(&self.retry, &self.cancel, &self.events, stage, None, |_| {
            analysis.strategize(request_ref)
        })
        .await;

        let document = match result {
            Ok(document) => document,
            Err(e) if e.is_cancelled() => return Err(PipelineError::Cancelled),
            Err(e) => {
                if let Some(failure) = UnitFailure::from_retry(stage, None, e) {
                    self.unit_failed(failure, &mut output);
                }
                return Ok(output);
            }
        };

        let payload = StrategizePayload {
            user_name: self.user_name.clone(),
            document,
        };
        output
            .written
            .push(self.store.put(StagePayload::Strategize(payload), None)?);
        self.unit_completed(stage, None);
        Ok(output)
    }
}

/// One Analyze unit: prepare, call with retries, persist.
async fn analyze_chat(
    chat_id: String,
    lines: Vec<String>,
    analysis: &dyn AnalysisService,
    store: &CheckpointStore,
    retry: &RetryPolicy,
    events: &EventBus,
    cancel: &CancellationToken,
) -> Result<UnitOutcome, CheckpointError> {
    let stage = Stage::Analyze;
    if lines.is_empty() {
        let failure = UnitFailure::new(
            stage,
            Some(&chat_id),
            FailureKind::Empty,
            "no messages left after filtering",
        );
        record_failure(events, &failure);
        return Ok(UnitOutcome::Failed(failure));
    }

    events.emit(unit_event(PipelineEventKind::UnitStarted, stage, Some(&chat_id)));
    let analyzed_messages = lines.len();
    let request = AnalysisRequest {
        chat_id: chat_id.clone(),
        lines,
    };
    let request_ref = &request;

    let result = retry_unit(retry, cancel, events, stage, Some(&chat_id), |_| {
        analysis.analyze_chat(request_ref)
    })
    .await;

    match result {
        Ok(result) => {
            let payload = AnalyzePayload {
                chat_id: chat_id.clone(),
                analyzed_messages,
                analysis: result,
            };
            let artifact = store.put(StagePayload::Analyze(payload), Some(&chat_id))?;
            events.emit(unit_event(PipelineEventKind::UnitCompleted, stage, Some(&chat_id)));
            Ok(UnitOutcome::Written(artifact))
        }
        Err(e) => match UnitFailure::from_retry(stage, Some(&chat_id), e) {
            Some(failure) => {
                record_failure(events, &failure);
                Ok(UnitOutcome::Failed(failure))
            }
            None => Ok(UnitOutcome::Cancelled),
        },
    }
}

/// Retry `op` under `policy`, reporting every scheduled retry as an event.
pub async fn retry_unit<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    events: &EventBus,
    stage: Stage,
    chat_id: Option<&str>,
    op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    policy
        .run(cancel, op, |attempt, error, delay| {
            events.emit(
                unit_event(PipelineEventKind::UnitRetried, stage, chat_id).with_data(
                    serde_json::json!({
                        "attempt": attempt,
                        "error": error.to_string(),
                        "delay_ms": delay.as_millis() as u64,
                    }),
                ),
            );
        })
        .await
}

fn required(inputs: &StageInputs, stage: Stage, input: Stage) -> Result<&Artifact, PipelineError> {
    inputs
        .single(input)
        .ok_or(PipelineError::MissingInput { stage, input })
}

fn unit_event(kind: PipelineEventKind, stage: Stage, chat_id: Option<&str>) -> PipelineEvent {
    let event = PipelineEvent::for_stage(kind, stage);
    match chat_id {
        Some(chat_id) => event.with_chat(chat_id),
        None => event,
    }
}

fn record_failure(events: &EventBus, failure: &UnitFailure) {
    tracing::warn!(
        stage = %failure.stage,
        chat_id = failure.chat_id.as_deref().unwrap_or("-"),
        attempts = failure.attempts,
        reason = %failure.reason,
        "Unit of work failed"
    );
    events.emit(
        unit_event(
            PipelineEventKind::UnitFailed,
            failure.stage,
            failure.chat_id.as_deref(),
        )
        .with_data(serde_json::json!({
            "reason": failure.reason,
            "attempts": failure.attempts,
            "kind": failure.kind,
        })),
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::pipeline::testing::{chat, FakeAnalysis, FakeClustering, FakeSource};
    use crate::state::PipelineDb;

    fn runner(source: FakeSource, analysis: Arc<FakeAnalysis>) -> (StageRunner, CheckpointStore) {
        shared_runner(Arc::new(source), analysis)
    }

    fn shared_runner(
        source: Arc<FakeSource>,
        analysis: Arc<FakeAnalysis>,
    ) -> (StageRunner, CheckpointStore) {
        let db = PipelineDb::open_in_memory().unwrap();
        let store = CheckpointStore::new(&db);
        let collaborators = Collaborators {
            source,
            analysis,
            clustering: Arc::new(FakeClustering::default()),
        };
        let runner = StageRunner::new(
            &PipelineConfig::default(),
            store.clone(),
            collaborators,
            EventBus::default(),
            CancellationToken::new(),
        )
        .with_retry_policy(RetryPolicy::exponential(3, Duration::from_millis(1)));
        (runner, store)
    }

    fn collected(store: &CheckpointStore) -> StageInputs {
        let mut inputs = StageInputs::new();
        inputs.insert(
            Stage::Collect,
            store
                .latest_per_chat(Stage::Collect)
                .unwrap()
                .into_values()
                .collect(),
        );
        inputs
    }

    #[tokio::test]
    async fn test_collect_skips_empty_chat() {
        let source = FakeSource::new(vec![chat("a", 50), chat("b", 0)]);
        let (runner, store) = runner(source, Arc::new(FakeAnalysis::default()));

        let output = runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await
            .unwrap();

        assert_eq!(output.written.len(), 1);
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].chat_id.as_deref(), Some("b"));
        assert_eq!(output.failures[0].kind, FailureKind::Empty);
        assert!(store.exists(Stage::Collect, Some("a")));
        assert!(!store.exists(Stage::Collect, Some("b")));
    }

    #[tokio::test]
    async fn test_collect_does_not_rewrite_unchanged_chat() {
        let source = FakeSource::new(vec![chat("a", 5)]);
        let (runner, store) = runner(source, Arc::new(FakeAnalysis::default()));

        runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await
            .unwrap();
        let first = store.get(Stage::Collect, Some("a")).unwrap();

        let output = runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await
            .unwrap();
        assert!(output.written.is_empty());
        assert_eq!(output.unchanged, vec!["a"]);
        assert_eq!(store.get(Stage::Collect, Some("a")).unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_collect_retires_emptied_and_removed_chats() {
        let source = Arc::new(FakeSource::new(vec![chat("a", 5), chat("b", 5), chat("c", 5)]));
        let (runner, store) = shared_runner(source.clone(), Arc::new(FakeAnalysis::default()));
        runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await
            .unwrap();

        source.replace(chat("b", 0));
        source.remove("c");
        let output = runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await
            .unwrap();

        assert_eq!(output.unchanged, vec!["a"]);
        assert_eq!(output.retired, vec!["b", "c"]);
        assert_eq!(output.produced(), 1);
        for chat_id in ["b", "c"] {
            let latest = store.get(Stage::Collect, Some(chat_id)).unwrap();
            assert!(latest.as_collect().unwrap().is_retired());
        }

        // Already retired chats are not written again
        let output = runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await
            .unwrap();
        assert!(output.retired.is_empty());
        assert_eq!(store.history(Stage::Collect, Some("c")).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_analyze_partial_success() {
        let source = FakeSource::new(vec![chat("a", 20), chat("b", 20), chat("c", 20)]);
        let analysis = Arc::new(FakeAnalysis::failing(&["c"]));
        let (runner, store) = runner(source, analysis.clone());

        runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await
            .unwrap();
        let output = runner
            .run_stage(Stage::Analyze, &collected(&store), &UnitScope::All)
            .await
            .unwrap();

        assert_eq!(output.written.len(), 2);
        assert_eq!(output.failures.len(), 1);
        let failure = &output.failures[0];
        assert_eq!(failure.chat_id.as_deref(), Some("c"));
        assert_eq!(failure.kind, FailureKind::Exhausted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(analysis.attempts_for("c"), 3);
        assert!(!store.exists(Stage::Analyze, Some("c")));
    }

    #[tokio::test]
    async fn test_analyze_respects_scope() {
        let source = FakeSource::new(vec![chat("a", 20), chat("b", 20)]);
        let analysis = Arc::new(FakeAnalysis::default());
        let (runner, store) = runner(source, analysis.clone());

        runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await
            .unwrap();
        let scope = UnitScope::Chats(["b".to_string()].into_iter().collect());
        let output = runner
            .run_stage(Stage::Analyze, &collected(&store), &scope)
            .await
            .unwrap();

        assert_eq!(output.written.len(), 1);
        assert_eq!(analysis.analyze_calls.load(Ordering::SeqCst), 1);
        assert!(store.exists(Stage::Analyze, Some("b")));
    }

    #[tokio::test]
    async fn test_analyze_short_messages_only() {
        let mut short = chat("short", 5);
        for message in &mut short.messages {
            message.text = "ok".to_string();
        }
        let analysis = Arc::new(FakeAnalysis::default());
        let (runner, store) = runner(FakeSource::new(vec![short]), analysis.clone());

        runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await
            .unwrap();
        let output = runner
            .run_stage(Stage::Analyze, &collected(&store), &UnitScope::All)
            .await
            .unwrap();

        assert!(output.written.is_empty());
        assert_eq!(output.failures[0].kind, FailureKind::Empty);
        assert_eq!(analysis.analyze_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_input_is_error() {
        let (runner, _) = runner(FakeSource::new(vec![]), Arc::new(FakeAnalysis::default()));
        let result = runner
            .run_stage(Stage::Cluster, &StageInputs::new(), &UnitScope::All)
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::MissingInput {
                stage: Stage::Cluster,
                input: Stage::Adapt
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (runner, _) = runner(
            FakeSource::new(vec![chat("a", 3)]),
            Arc::new(FakeAnalysis::default()),
        );
        runner.cancel.cancel();
        let result = runner
            .run_stage(Stage::Collect, &StageInputs::new(), &UnitScope::All)
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
