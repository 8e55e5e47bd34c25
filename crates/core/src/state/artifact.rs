//! # Artifacts
//!
//! Immutable, stage-tagged outputs persisted by the checkpoint store. The
//! payload is a sum type with one explicit schema per stage, so a stage can
//! never silently consume another stage's output.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::pipeline::Stage;
use crate::services::{ChatAnalysis, ChatMessage, StrategyDocument, Topic};

/// A stored stage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Row id; increases with every write
    pub id: i64,
    pub stage: Stage,
    /// Present for per-chat stages only
    pub source_chat_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub payload: StagePayload,
}

impl Artifact {
    pub fn is_newer_than(&self, other: &Artifact) -> bool {
        self.created_at > other.created_at
    }

    pub fn as_collect(&self) -> Result<&CollectPayload, PipelineError> {
        match &self.payload {
            StagePayload::Collect(p) => Ok(p),
            other => Err(mismatch(Stage::Collect, other)),
        }
    }

    pub fn as_analyze(&self) -> Result<&AnalyzePayload, PipelineError> {
        match &self.payload {
            StagePayload::Analyze(p) => Ok(p),
            other => Err(mismatch(Stage::Analyze, other)),
        }
    }

    pub fn as_adapt(&self) -> Result<&AdaptPayload, PipelineError> {
        match &self.payload {
            StagePayload::Adapt(p) => Ok(p),
            other => Err(mismatch(Stage::Adapt, other)),
        }
    }

    pub fn as_cluster(&self) -> Result<&ClusterPayload, PipelineError> {
        match &self.payload {
            StagePayload::Cluster(p) => Ok(p),
            other => Err(mismatch(Stage::Cluster, other)),
        }
    }

    pub fn as_strategize(&self) -> Result<&StrategizePayload, PipelineError> {
        match &self.payload {
            StagePayload::Strategize(p) => Ok(p),
            other => Err(mismatch(Stage::Strategize, other)),
        }
    }
}

fn mismatch(expected: Stage, found: &StagePayload) -> PipelineError {
    PipelineError::PayloadMismatch {
        expected,
        found: found.stage(),
    }
}

/// Stage-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum StagePayload {
    Collect(CollectPayload),
    Analyze(AnalyzePayload),
    Adapt(AdaptPayload),
    Cluster(ClusterPayload),
    Strategize(StrategizePayload),
}

impl StagePayload {
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::Collect(_) => Stage::Collect,
            StagePayload::Analyze(_) => Stage::Analyze,
            StagePayload::Adapt(_) => Stage::Adapt,
            StagePayload::Cluster(_) => Stage::Cluster,
            StagePayload::Strategize(_) => Stage::Strategize,
        }
    }
}

/// Raw messages of one chat.
///
/// A payload without messages retires the chat: it was removed from the
/// source or emptied, and its older artifacts no longer count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectPayload {
    pub chat_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl CollectPayload {
    pub fn retired(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            title: None,
            messages: Vec::new(),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Analysis of one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzePayload {
    pub chat_id: String,
    /// Messages that survived filtering and sampling
    pub analyzed_messages: usize,
    pub analysis: ChatAnalysis,
}

/// A topic tagged with the chat it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcedTopic {
    pub source_chat: String,
    #[serde(flatten)]
    pub topic: Topic,
}

/// Similar topics merged across chats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedTopic {
    pub name: String,
    pub keywords: Vec<String>,
    pub percentage: f32,
    #[serde(default)]
    pub sentiment: Option<f32>,
    #[serde(default)]
    pub description: String,
    pub source_chats: BTreeSet<String>,
}

/// Merged view over every successfully analysed chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptPayload {
    pub chat_ids: BTreeSet<String>,
    pub topics: Vec<SourcedTopic>,
    pub aggregated: Vec<AggregatedTopic>,
    pub sentiment: BTreeMap<String, f32>,
    pub monetization_hints: Vec<String>,
    pub total_topics: usize,
    pub total_chats: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCluster {
    pub id: usize,
    pub label: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPayload {
    pub k: usize,
    pub dimensions: usize,
    pub clusters: Vec<TopicCluster>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategizePayload {
    pub user_name: String,
    pub document: StrategyDocument,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_tagging() {
        let payload = StagePayload::Collect(CollectPayload {
            chat_id: "a".into(),
            title: None,
            messages: vec![],
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["stage"], "collect");
        assert_eq!(payload.stage(), Stage::Collect);
    }

    #[test]
    fn test_accessor_mismatch() {
        let artifact = Artifact {
            id: 1,
            stage: Stage::Cluster,
            source_chat_id: None,
            created_at: Utc::now(),
            payload: StagePayload::Cluster(ClusterPayload {
                k: 0,
                dimensions: 0,
                clusters: vec![],
            }),
        };
        assert!(artifact.as_cluster().is_ok());
        assert!(matches!(
            artifact.as_adapt(),
            Err(PipelineError::PayloadMismatch {
                expected: Stage::Adapt,
                found: Stage::Cluster
            })
        ));
    }
}
