//! # Collaborators
//!
//! Contracts of the external services the stage runner delegates to. The
//! runner only sees these traits; concrete implementations live in
//! `tools::collector` (message source), `skills` (LLM analysis and
//! embeddings) and `report` (markdown renderer).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use crate::state::{AdaptPayload, ClusterPayload, StrategizePayload};

/// One message as supplied by the message source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Raw chat record: id plus its ordered messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChat {
    pub chat_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// A topic extracted from chat text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Share of the chat's messages about this topic, 0-100
    #[serde(default)]
    pub percentage: f32,
    #[serde(default)]
    pub description: String,
}

/// Result of analysing one chat.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatAnalysis {
    pub topics: Vec<Topic>,
    /// Topic name -> sentiment score in [-1, 1]
    #[serde(default)]
    pub sentiment: BTreeMap<String, f32>,
    #[serde(default)]
    pub monetization_hints: Vec<String>,
}

impl ChatAnalysis {
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.name.clone()).collect()
    }
}

/// Prepared input for one chat analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub chat_id: String,
    /// Rendered `author: text` lines, already filtered and sampled
    pub lines: Vec<String>,
}

/// Embedding vectors and a cluster assignment per topic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopicClustering {
    pub vectors: Vec<Vec<f32>>,
    pub assignments: Vec<usize>,
}

/// Commercial potential of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommercialPotential {
    High,
    Medium,
    Low,
}

impl CommercialPotential {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommercialPotential::High => "high",
            CommercialPotential::Medium => "medium",
            CommercialPotential::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "high" => Some(CommercialPotential::High),
            "medium" => Some(CommercialPotential::Medium),
            "low" => Some(CommercialPotential::Low),
            _ => None,
        }
    }
}

/// Input of the strategy call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRequest {
    pub user_name: String,
    pub topics: Vec<crate::state::AggregatedTopic>,
    pub clusters: Vec<crate::state::TopicCluster>,
    pub sentiment: BTreeMap<String, f32>,
    pub monetization_hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonetizationOpportunity {
    pub topic: String,
    pub commercial_potential: CommercialPotential,
    #[serde(default)]
    pub realistic_revenue: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub first_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StrategyDocument {
    pub summary: String,
    #[serde(default)]
    pub transformation_key: Option<String>,
    #[serde(default)]
    pub opportunities: Vec<MonetizationOpportunity>,
}

/// Supplies raw per-chat message records. Consumed by Collect.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn list_chats(&self) -> Result<Vec<String>, ServiceError>;

    async fn load_chat(&self, chat_id: &str) -> Result<RawChat, ServiceError>;
}

/// LLM-backed analysis. Consumed by Analyze and Strategize.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze_chat(&self, request: &AnalysisRequest) -> Result<ChatAnalysis, ServiceError>;

    async fn strategize(&self, request: &StrategyRequest) -> Result<StrategyDocument, ServiceError>;
}

/// Embeds topic strings and clusters the vectors. Consumed by Cluster.
#[async_trait]
pub trait ClusteringService: Send + Sync {
    async fn cluster(&self, topics: &[String], k: usize) -> Result<TopicClustering, ServiceError>;
}

/// Turns final artifacts into human-readable output.
pub trait ReportRenderer: Send + Sync {
    fn render(
        &self,
        adapt: &AdaptPayload,
        clusters: Option<&ClusterPayload>,
        strategy: Option<&StrategizePayload>,
    ) -> String;
}
