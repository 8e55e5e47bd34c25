//! # LLM Analysis Service
//!
//! [`AnalysisService`] backed by the topic and strategy skills. A chat is
//! analysed chunk by chunk and the chunk results are merged into one
//! analysis.
//!
//! A chunk that fails transiently fails the whole chat with that error, so
//! the runner's retry policy retries it. Chunks already analysed are kept
//! and the next attempt resumes with the first missing chunk. A chunk that
//! fails permanently is dropped as long as another chunk succeeds.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{StrategySkill, TopicSkill};
use crate::errors::ServiceError;
use crate::models::ModelConfig;
use crate::services::{
    AnalysisRequest, AnalysisService, ChatAnalysis, StrategyDocument, StrategyRequest,
};
use crate::tools::topics::merge_chunk_analyses;
use crate::tools::transcript::chunk_lines;

/// Analyses one chunk of chat text.
#[async_trait]
pub trait ChunkAnalyzer: Send + Sync {
    async fn analyze_chunk(&self, chunk: &str) -> Result<ChatAnalysis, ServiceError>;
}

/// [`ChunkAnalyzer`] running [`TopicSkill`] against the analysis model.
pub struct TopicChunkAnalyzer {
    model: ModelConfig,
}

impl TopicChunkAnalyzer {
    pub fn new(model: ModelConfig) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ChunkAnalyzer for TopicChunkAnalyzer {
    async fn analyze_chunk(&self, chunk: &str) -> Result<ChatAnalysis, ServiceError> {
        TopicSkill::run(chunk, &self.model)
            .await
            .map(|output| output.into_analysis())
            .map_err(|e| ServiceError::classify(&e))
    }
}

/// Chunk index -> (chunk text, analysis)
type ChunkResults = BTreeMap<usize, (String, ChatAnalysis)>;

pub struct LlmAnalysisService {
    chunks: Arc<dyn ChunkAnalyzer>,
    strategy_model: ModelConfig,
    max_chunk_chars: usize,
    /// Analysed chunks of chats whose last attempt failed transiently
    pending: Mutex<HashMap<String, ChunkResults>>,
}

impl LlmAnalysisService {
    pub fn new(analysis_model: ModelConfig, strategy_model: ModelConfig, max_chunk_chars: usize) -> Self {
        Self {
            chunks: Arc::new(TopicChunkAnalyzer::new(analysis_model)),
            strategy_model,
            max_chunk_chars: max_chunk_chars.max(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the chunk analyser.
    pub fn with_chunk_analyzer(mut self, chunks: Arc<dyn ChunkAnalyzer>) -> Self {
        self.chunks = chunks;
        self
    }

    fn take_pending(&self, chat_id: &str) -> ChunkResults {
        match self.pending.lock() {
            Ok(mut pending) => pending.remove(chat_id).unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().remove(chat_id).unwrap_or_default(),
        }
    }

    fn keep_pending(&self, chat_id: &str, done: ChunkResults) {
        if done.is_empty() {
            return;
        }
        match self.pending.lock() {
            Ok(mut pending) => pending.insert(chat_id.to_string(), done),
            Err(poisoned) => poisoned.into_inner().insert(chat_id.to_string(), done),
        };
    }
}

#[async_trait]
impl AnalysisService for LlmAnalysisService {
    async fn analyze_chat(&self, request: &AnalysisRequest) -> Result<ChatAnalysis, ServiceError> {
        let chunks = chunk_lines(&request.lines, self.max_chunk_chars);
        if chunks.is_empty() {
            return Err(ServiceError::InvalidInput(format!(
                "chat {} has no text to analyse",
                request.chat_id
            )));
        }

        let total = chunks.len();
        // Results only count if the chunk text is the same as last time
        let mut done: ChunkResults = self
            .take_pending(&request.chat_id)
            .into_iter()
            .filter(|(idx, (text, _))| chunks.get(*idx) == Some(text))
            .collect();
        if !done.is_empty() {
            tracing::debug!(chat_id = %request.chat_id, reused = done.len(), total, "Resuming chat");
        }
        let mut dropped = 0;
        let mut last_error = None;

        for (idx, chunk) in chunks.iter().enumerate() {
            if done.contains_key(&idx) {
                continue;
            }
            tracing::debug!(chat_id = %request.chat_id, chunk = idx + 1, total, "Analysing chunk");
            match self.chunks.analyze_chunk(chunk).await {
                Ok(analysis) => {
                    done.insert(idx, (chunk.clone(), analysis));
                }
                Err(error) if error.is_retryable() => {
                    tracing::warn!(
                        chat_id = %request.chat_id,
                        chunk = idx + 1,
                        total,
                        error = %error,
                        "Chunk analysis interrupted"
                    );
                    self.keep_pending(&request.chat_id, done);
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(
                        chat_id = %request.chat_id,
                        chunk = idx + 1,
                        total,
                        error = %error,
                        "Chunk dropped"
                    );
                    dropped += 1;
                    last_error = Some(error);
                }
            }
        }

        if done.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                ServiceError::InvalidResponse("no chunk could be analysed".to_string())
            }));
        }
        if dropped > 0 {
            tracing::warn!(
                chat_id = %request.chat_id,
                analysed = done.len(),
                total,
                "Chat analysed partially"
            );
        }

        let parts = done
            .into_values()
            .map(|(text, analysis)| (text.chars().count(), analysis))
            .collect();
        Ok(merge_chunk_analyses(parts))
    }

    async fn strategize(&self, request: &StrategyRequest) -> Result<StrategyDocument, ServiceError> {
        tracing::info!(
            model = %self.strategy_model.model,
            topics = request.topics.len(),
            clusters = request.clusters.len(),
            "Requesting strategy"
        );
        StrategySkill::run(request, &self.strategy_model)
            .await
            .map(|output| output.into_document(&request.topics))
            .map_err(|e| ServiceError::classify(&e))
    }
}
