//! # Skills
//!
//! LLM-backed implementations of the analysis collaborators.
//!
//! - `TopicSkill` - Topics, sentiment and hints for one chunk of chat text
//! - `StrategySkill` - Monetization strategy over the merged topics
//! - `LlmAnalysisService` - `AnalysisService` built on the two skills
//! - `EmbeddingClusterer` - `ClusteringService` over an embeddings API

pub mod embedding;
pub mod llm_helpers;
pub mod llm_service;
pub mod prompts;
pub mod strategy_skill;
pub mod topic_skill;

pub use embedding::{Embedder, EmbeddingClusterer, OpenAiEmbeddings};
pub use llm_service::{ChunkAnalyzer, LlmAnalysisService, TopicChunkAnalyzer};
pub use strategy_skill::{StrategyOutput, StrategySkill};
pub use topic_skill::{TopicAnalysisOutput, TopicSkill};
