//! # Chatsoul Core
//!
//! Resumable chat-analysis pipeline: collect chats, analyse each one with an
//! LLM, merge the analyses, cluster the topics and derive a monetization
//! strategy. Every stage checkpoints its output, so an interrupted or
//! partially failed run picks up where it stopped.
//!
//! ## Architecture
//!
//! - `pipeline/` - Stages, retry policy, stage runner and orchestrator
//! - `state/` - Artifacts and the SQLite checkpoint store
//! - `services` - Collaborator traits (message source, analysis, clustering, report)
//! - `skills/` - LLM and embedding implementations of the collaborators
//! - `tools/` - Deterministic helpers (collector, transcript prep, topic merging, k-means)
//! - `config` - The run configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chatsoul_core::config::PipelineConfig;
//! use chatsoul_core::pipeline::{Collaborators, Orchestrator};
//! use chatsoul_core::state::{CheckpointStore, PipelineDb};
//!
//! let config = PipelineConfig::default();
//! let db = PipelineDb::open_at(&config.db_path)?;
//! let orchestrator = Orchestrator::new(
//!     config.clone(),
//!     CheckpointStore::new(&db),
//!     Collaborators::live(&config),
//! );
//! let summary = orchestrator.run().await?;
//! ```

pub mod config;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod services;
pub mod skills;
pub mod state;
pub mod tools;
