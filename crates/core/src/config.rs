//! # Pipeline Configuration
//!
//! One explicit configuration value, built at process start and handed to the
//! orchestrator. Defaults can be overridden from `.chatsoul/config.json`; the
//! CLI applies its flags on top.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::models::ModelConfig;
use crate::pipeline::{RetryPolicy, Stage};
use crate::state::io::{get_runtime_path, read_optional};
use crate::tools::transcript::PrepareOptions;

/// How Analyze treats chats when some of them are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegenerationMode {
    /// Re-analyse only chats without a current analysis
    #[default]
    MissingOnly,
    /// Re-analyse every chat as soon as any is stale
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Where Collect reads raw messages
    pub chat_source_dir: PathBuf,
    /// Checkpoint database location
    pub db_path: PathBuf,
    /// Where the report is written
    pub output_dir: PathBuf,
    /// Last stage to run this invocation
    pub terminal_stage: Stage,
    /// Trust checkpoints before this stage and run from here
    pub resume_from: Option<Stage>,
    /// Stages treated as stale unconditionally
    pub force_regenerate: BTreeSet<Stage>,
    pub regeneration_mode: RegenerationMode,
    /// Attempts per unit of work, the first included
    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub max_concurrent_chat_workers: usize,
    pub messages_limit: usize,
    pub min_message_chars: usize,
    pub max_chunk_chars: usize,
    pub cluster_count: usize,
    pub user_name: String,
    pub analysis_model: ModelConfig,
    pub strategy_model: ModelConfig,
    pub embedding_model: String,
    /// Base URL of the OpenAI-compatible embeddings API
    pub embedding_base_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let runtime = get_runtime_path();
        Self {
            chat_source_dir: PathBuf::from("chats"),
            db_path: runtime.join("checkpoints.db"),
            output_dir: PathBuf::from("reports"),
            terminal_stage: Stage::Strategize,
            resume_from: None,
            force_regenerate: BTreeSet::new(),
            regeneration_mode: RegenerationMode::MissingOnly,
            max_retries: 3,
            retry_backoff_base_ms: 1000,
            max_concurrent_chat_workers: 5,
            messages_limit: 1000,
            min_message_chars: 10,
            max_chunk_chars: 8000,
            cluster_count: 10,
            user_name: "User".to_string(),
            analysis_model: ModelConfig::analysis_default(),
            strategy_model: ModelConfig::strategy_default(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        get_runtime_path().join("config.json")
    }

    /// Load from a JSON file; a missing file yields the defaults and missing
    /// fields keep their default values.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match read_optional(path).await? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse config file: {:?}", path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_retries == 0 {
            return Err(PipelineError::Config(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_chat_workers == 0 {
            return Err(PipelineError::Config(
                "max_concurrent_chat_workers must be at least 1".to_string(),
            ));
        }
        if self.cluster_count == 0 {
            return Err(PipelineError::Config(
                "cluster_count must be at least 1".to_string(),
            ));
        }
        if self.max_chunk_chars == 0 {
            return Err(PipelineError::Config(
                "max_chunk_chars must be at least 1".to_string(),
            ));
        }
        if let Some(resume) = self.resume_from {
            if resume > self.terminal_stage {
                return Err(PipelineError::Config(format!(
                    "resume_from ({}) is after terminal_stage ({})",
                    resume, self.terminal_stage
                )));
            }
        }
        Ok(())
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.retry_backoff_base())
    }

    pub fn prepare_options(&self) -> PrepareOptions {
        PrepareOptions {
            min_chars: self.min_message_chars,
            limit: self.messages_limit,
        }
    }
}
