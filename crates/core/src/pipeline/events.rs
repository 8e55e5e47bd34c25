//! # Pipeline Events
//!
//! Typed lifecycle events of a run. They are forwarded to an optional channel
//! as they happen and retained for the run summary.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::Stage;

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    RunStarted,
    StageSkipped,
    StageStarted,
    StageCompleted,
    StageFailed,
    /// One chat (or the single aggregate unit) started
    UnitStarted,
    /// A transient failure will be retried
    UnitRetried,
    UnitCompleted,
    /// A unit was excluded from the stage output
    UnitFailed,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            stage: None,
            chat_id: None,
            data: None,
        }
    }

    pub fn for_stage(kind: PipelineEventKind, stage: Stage) -> Self {
        Self::new(kind).with_stage(stage)
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_chat(mut self, chat_id: &str) -> Self {
        self.chat_id = Some(chat_id.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Fan-out for events: an optional channel plus the retained log.
#[derive(Clone, Default)]
pub struct EventBus {
    tx: Option<mpsc::Sender<PipelineEvent>>,
    log: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl EventBus {
    pub fn new(tx: Option<mpsc::Sender<PipelineEvent>>) -> Self {
        Self {
            tx,
            log: Arc::default(),
        }
    }

    /// Record an event. A full or closed channel drops the forwarded copy;
    /// the retained log always keeps it.
    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event.clone()) {
                tracing::debug!(error = %e, "Event channel unavailable, event kept in log only");
            }
        }
        if let Ok(mut log) = self.log.lock() {
            log.push(event);
        }
    }

    pub fn snapshot(&self) -> Vec<PipelineEvent> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = PipelineEvent::for_stage(PipelineEventKind::UnitFailed, Stage::Analyze)
            .with_chat("chat-7");

        assert_eq!(event.stage, Some(Stage::Analyze));
        assert_eq!(event.chat_id.as_deref(), Some("chat-7"));
        assert!(!event.id.is_empty());
    }

    #[tokio::test]
    async fn test_bus_forwards_and_retains() {
        let (tx, mut rx) = mpsc::channel(4);
        let bus = EventBus::new(Some(tx));

        bus.emit(PipelineEvent::new(PipelineEventKind::RunStarted));

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.kind, PipelineEventKind::RunStarted);
        assert_eq!(bus.snapshot().len(), 1);
    }

    #[test]
    fn test_bus_without_channel() {
        let bus = EventBus::default();
        bus.emit(PipelineEvent::new(PipelineEventKind::RunCompleted));
        bus.clone().emit(PipelineEvent::new(PipelineEventKind::RunCompleted));
        assert_eq!(bus.snapshot().len(), 2);
    }
}
