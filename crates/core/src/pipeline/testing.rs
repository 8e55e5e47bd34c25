//! In-memory collaborators for runner and orchestrator tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

use crate::errors::ServiceError;
use crate::services::{
    AnalysisRequest, AnalysisService, ChatAnalysis, ChatMessage, ClusteringService,
    MessageSource, RawChat, StrategyDocument, StrategyRequest, Topic, TopicClustering,
};

/// A chat with `messages` messages long enough to survive filtering.
pub fn chat(chat_id: &str, messages: usize) -> RawChat {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    RawChat {
        chat_id: chat_id.to_string(),
        title: Some(format!("Chat {}", chat_id)),
        messages: (0..messages)
            .map(|i| ChatMessage {
                author: format!("user{}", i % 3),
                timestamp: start + Duration::minutes(i as i64),
                text: format!("message number {} in {} about cooking and money", i, chat_id),
            })
            .collect(),
    }
}

#[derive(Default)]
pub struct FakeSource {
    chats: Mutex<Vec<RawChat>>,
    pub list_calls: AtomicUsize,
    pub load_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(chats: Vec<RawChat>) -> Self {
        Self {
            chats: Mutex::new(chats),
            ..Default::default()
        }
    }

    pub fn push(&self, chat: RawChat) {
        self.chats.lock().unwrap().push(chat);
    }

    /// Replace the chat with the same id.
    pub fn replace(&self, chat: RawChat) {
        let mut chats = self.chats.lock().unwrap();
        chats.retain(|c| c.chat_id != chat.chat_id);
        chats.push(chat);
    }

    pub fn remove(&self, chat_id: &str) {
        self.chats.lock().unwrap().retain(|c| c.chat_id != chat_id);
    }

    pub fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst) + self.load_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn list_chats(&self) -> Result<Vec<String>, ServiceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .chats
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.chat_id.clone())
            .collect())
    }

    async fn load_chat(&self, chat_id: &str) -> Result<RawChat, ServiceError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.chats
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.chat_id == chat_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(chat_id.to_string()))
    }
}

/// Analysis that fails transiently, on every attempt, for the listed chats.
#[derive(Default)]
pub struct FakeAnalysis {
    failing: BTreeSet<String>,
    attempts: Mutex<BTreeMap<String, usize>>,
    pub analyze_calls: AtomicUsize,
    pub strategize_calls: AtomicUsize,
}

impl FakeAnalysis {
    pub fn failing(chats: &[&str]) -> Self {
        Self {
            failing: chats.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn attempts_for(&self, chat_id: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(chat_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst) + self.strategize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisService for FakeAnalysis {
    async fn analyze_chat(&self, request: &AnalysisRequest) -> Result<ChatAnalysis, ServiceError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(request.chat_id.clone())
            .or_default() += 1;

        if self.failing.contains(&request.chat_id) {
            return Err(ServiceError::Network("connection reset".to_string()));
        }

        let own = format!("Hobby {}", request.chat_id);
        Ok(ChatAnalysis {
            topics: vec![
                Topic {
                    name: own.clone(),
                    keywords: vec![request.chat_id.clone()],
                    percentage: 60.0,
                    description: String::new(),
                },
                Topic {
                    name: "Business".to_string(),
                    keywords: vec!["money".to_string(), "sales".to_string()],
                    percentage: 40.0,
                    description: String::new(),
                },
            ],
            sentiment: [(own, 0.5), ("Business".to_string(), 0.1)]
                .into_iter()
                .collect(),
            monetization_hints: vec!["sell a course".to_string()],
        })
    }

    async fn strategize(&self, request: &StrategyRequest) -> Result<StrategyDocument, ServiceError> {
        self.strategize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(StrategyDocument {
            summary: format!("{} topics for {}", request.topics.len(), request.user_name),
            transformation_key: None,
            opportunities: Vec::new(),
        })
    }
}

/// Assigns topic `i` to cluster `i % k` with one-dimensional vectors.
#[derive(Default)]
pub struct FakeClustering {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ClusteringService for FakeClustering {
    async fn cluster(&self, topics: &[String], k: usize) -> Result<TopicClustering, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TopicClustering {
            vectors: (0..topics.len()).map(|i| vec![i as f32]).collect(),
            assignments: (0..topics.len()).map(|i| i % k.max(1)).collect(),
        })
    }
}
