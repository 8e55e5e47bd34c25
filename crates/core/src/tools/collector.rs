//! # Directory Message Source
//!
//! Reads exported chats from a directory. A chat is either
//! `<root>/<chat_id>.json` or `<root>/<chat_id>/messages.json`; the file holds
//! a JSON array of messages or an object with a `messages` array and an
//! optional `title`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::errors::ServiceError;
use crate::services::{ChatMessage, MessageSource, RawChat};

const MESSAGES_FILE: &str = "messages.json";

pub struct DirectoryMessageSource {
    root: PathBuf,
}

impl DirectoryMessageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chat_path(&self, chat_id: &str) -> Option<PathBuf> {
        let nested = self.root.join(chat_id).join(MESSAGES_FILE);
        if nested.is_file() {
            return Some(nested);
        }
        let flat = self.root.join(format!("{}.json", chat_id));
        flat.is_file().then_some(flat)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChatFile {
    Wrapped {
        #[serde(default, alias = "name")]
        title: Option<String>,
        messages: Vec<MessageRecord>,
    },
    Bare(Vec<MessageRecord>),
}

#[derive(Deserialize)]
struct MessageRecord {
    #[serde(default, alias = "sender", alias = "from", alias = "sender_name")]
    author: Option<String>,
    #[serde(default, alias = "date")]
    timestamp: Option<RecordTime>,
    #[serde(default, alias = "content", alias = "message")]
    text: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordTime {
    Rfc3339(DateTime<Utc>),
    Unix(i64),
    Other(String),
}

impl RecordTime {
    fn to_utc(&self) -> DateTime<Utc> {
        match self {
            RecordTime::Rfc3339(ts) => *ts,
            RecordTime::Unix(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            RecordTime::Other(raw) => {
                chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                    .map(|naive| naive.and_utc())
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            }
        }
    }
}

/// Exports store text either as a string or as a list of plain strings and
/// formatted entities.
fn flatten_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                serde_json::Value::String(s) => s.clone(),
                other => other
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Parse one chat file. Messages without text are dropped; the rest are
/// ordered by timestamp, ties keeping file order.
pub fn parse_chat(chat_id: &str, raw: &str) -> Result<RawChat, ServiceError> {
    let file: ChatFile = serde_json::from_str(raw)
        .map_err(|e| ServiceError::InvalidInput(format!("chat {}: {}", chat_id, e)))?;

    let (title, records) = match file {
        ChatFile::Wrapped { title, messages } => (title, messages),
        ChatFile::Bare(messages) => (None, messages),
    };

    let mut messages: Vec<ChatMessage> = records
        .into_iter()
        .filter_map(|record| {
            let text = record.text.as_ref().map(flatten_text)?;
            if text.trim().is_empty() {
                return None;
            }
            Some(ChatMessage {
                author: record.author.unwrap_or_default(),
                timestamp: record
                    .timestamp
                    .as_ref()
                    .map(RecordTime::to_utc)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                text,
            })
        })
        .collect();
    messages.sort_by_key(|m| m.timestamp);

    Ok(RawChat {
        chat_id: chat_id.to_string(),
        title,
        messages,
    })
}

#[async_trait]
impl MessageSource for DirectoryMessageSource {
    async fn list_chats(&self) -> Result<Vec<String>, ServiceError> {
        if !self.root.is_dir() {
            return Err(ServiceError::NotFound(format!(
                "chat source directory {:?}",
                self.root
            )));
        }

        let mut chats: Vec<String> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let path = entry.path();
                let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
                match entry.depth() {
                    1 if is_json => path.file_stem()?.to_str().map(str::to_string),
                    2 if path.file_name()?.to_str() == Some(MESSAGES_FILE) => {
                        path.parent()?.file_name()?.to_str().map(str::to_string)
                    }
                    _ => None,
                }
            })
            .collect();

        chats.sort();
        chats.dedup();
        tracing::debug!(root = ?self.root, count = chats.len(), "Listed chats");
        Ok(chats)
    }

    async fn load_chat(&self, chat_id: &str) -> Result<RawChat, ServiceError> {
        let path = self
            .chat_path(chat_id)
            .ok_or_else(|| ServiceError::NotFound(format!("chat {}", chat_id)))?;
        let raw = tokio::fs::read_to_string(&path).await?;
        parse_chat(chat_id, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_with_aliases() {
        let raw = r#"{
            "name": "Book club",
            "messages": [
                {"from": "bob", "date": 1700000100, "text": "second"},
                {"sender": "alice", "date": "2023-11-14T22:13:20Z", "content": "first"},
                {"from": "carol", "date": 1700000200, "text": ""},
                {"from": "dave", "date": 1700000300, "text": ["bold ", {"type": "bold", "text": "part"}]}
            ]
        }"#;

        let chat = parse_chat("club", raw).unwrap();
        assert_eq!(chat.title.as_deref(), Some("Book club"));
        let texts: Vec<_> = chat.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "bold part"]);
        assert_eq!(chat.messages[0].author, "alice");
    }

    #[test]
    fn test_parse_bare_array() {
        let raw = r#"[{"author": "a", "timestamp": "2024-01-01T00:00:00Z", "text": "hi there"}]"#;
        let chat = parse_chat("x", raw).unwrap();
        assert_eq!(chat.messages.len(), 1);
        assert!(chat.title.is_none());
    }

    #[test]
    fn test_parse_garbage_is_permanent() {
        let err = parse_chat("x", "{ nope").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_directory_layouts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("flat.json"), "[]").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("nested").join(MESSAGES_FILE),
            r#"{"messages": [{"author": "a", "text": "hello world"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = DirectoryMessageSource::new(dir.path());
        assert_eq!(source.list_chats().await.unwrap(), vec!["flat", "nested"]);

        let nested = source.load_chat("nested").await.unwrap();
        assert_eq!(nested.messages.len(), 1);
        assert!(source.load_chat("flat").await.unwrap().messages.is_empty());
        assert!(matches!(
            source.load_chat("missing").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_root() {
        let source = DirectoryMessageSource::new("/definitely/not/here");
        assert!(source.list_chats().await.is_err());
    }
}
