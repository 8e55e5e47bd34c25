//! # Checkpoint Store
//!
//! Durable artifacts keyed by `(stage, optional chat id)`. Writes append a
//! new version; reads return the most recent one. A record that fails to
//! decode is logged and treated exactly like a missing one, so resuming a run
//! degrades to regeneration instead of an error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::artifact::{Artifact, StagePayload};
use super::db::PipelineDb;
use crate::errors::CheckpointError;
use crate::pipeline::Stage;

/// Raw row as stored, before decoding.
struct StoredRow {
    id: i64,
    stage: String,
    chat_id: String,
    created_at: String,
    payload: String,
}

/// One stored version of a key, as listed by [`CheckpointStore::history`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointVersion {
    pub id: i64,
    pub stage: Stage,
    pub chat_id: Option<String>,
    pub created_at: String,
    /// False when the row would be treated as absent
    pub readable: bool,
}

/// Number of keys and stored versions per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCheckpoints {
    pub stage: Stage,
    pub keys: usize,
    pub versions: usize,
    pub latest_at: Option<String>,
}

/// Checkpoint store backed by the pipeline database
#[derive(Clone)]
pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl CheckpointStore {
    pub fn new(db: &PipelineDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CheckpointError> {
        self.conn
            .lock()
            .map_err(|e| CheckpointError::Storage(format!("Lock error: {}", e)))
    }

    /// Write a new artifact. The stage is taken from the payload tag.
    ///
    /// `created_at` is strictly greater than every timestamp already stored,
    /// so two writes never tie even when the clock does.
    pub fn put(
        &self,
        payload: StagePayload,
        chat_id: Option<&str>,
    ) -> Result<Artifact, CheckpointError> {
        let stage = payload.stage();
        let key = key_for(stage, chat_id)?;
        let payload_json = serde_json::to_string(&payload)?;

        let conn = self.lock()?;

        // Stored timestamps are fixed-width RFC 3339, so text order is time
        // order; rows that do not parse are skipped
        let last = {
            let mut stmt =
                conn.prepare("SELECT created_at FROM checkpoints ORDER BY created_at DESC")?;
            let mut rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let newest = rows.find_map(|raw| raw.ok().as_deref().and_then(parse_timestamp));
            newest
        };
        let mut created_at = Utc::now();
        if let Some(prev) = last {
            if created_at <= prev {
                created_at = prev + chrono::Duration::nanoseconds(1);
            }
        }

        conn.execute(
            "INSERT INTO checkpoints (stage, chat_id, created_at, payload) VALUES (?1, ?2, ?3, ?4)",
            params![stage.as_str(), key, format_timestamp(&created_at), payload_json],
        )?;
        let id = conn.last_insert_rowid();

        tracing::debug!(stage = %stage, chat_id = %key, id, "Checkpoint written");

        Ok(Artifact {
            id,
            stage,
            source_chat_id: chat_id.map(str::to_string),
            created_at,
            payload,
        })
    }

    /// Most recent artifact for the key.
    pub fn get(&self, stage: Stage, chat_id: Option<&str>) -> Result<Artifact, CheckpointError> {
        let key = key_for(stage, chat_id)?;
        let not_found = || CheckpointError::NotFound {
            stage,
            chat_id: chat_id.map(str::to_string),
        };

        let row = {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    r#"
                    SELECT id, stage, chat_id, created_at, payload
                    FROM checkpoints
                    WHERE stage = ?1 AND chat_id = ?2
                    ORDER BY id DESC
                    LIMIT 1
                    "#,
                    params![stage.as_str(), key],
                    read_row,
                )
                .optional()?;
            row
        };

        let row = row.ok_or_else(not_found)?;
        decode_logged(stage, row).ok_or_else(not_found)
    }

    /// Never fails: storage errors and corrupt records both read as absent.
    pub fn exists(&self, stage: Stage, chat_id: Option<&str>) -> bool {
        self.get(stage, chat_id).is_ok()
    }

    /// Chats that have a readable checkpoint for a per-chat stage.
    pub fn list_chat_ids(&self, stage: Stage) -> Result<BTreeSet<String>, CheckpointError> {
        Ok(self.latest_per_chat(stage)?.into_keys().collect())
    }

    /// Latest readable artifact of every chat for a per-chat stage.
    pub fn latest_per_chat(
        &self,
        stage: Stage,
    ) -> Result<BTreeMap<String, Artifact>, CheckpointError> {
        if !stage.is_per_chat() {
            return Err(CheckpointError::InvalidKey(format!(
                "{} is not a per-chat stage",
                stage
            )));
        }

        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT c.id, c.stage, c.chat_id, c.created_at, c.payload
                FROM checkpoints c
                JOIN (
                    SELECT chat_id, MAX(id) AS max_id
                    FROM checkpoints
                    WHERE stage = ?1 AND chat_id != ''
                    GROUP BY chat_id
                ) latest ON c.id = latest.max_id
                ORDER BY c.chat_id
                "#,
            )?;
            let rows = stmt
                .query_map(params![stage.as_str()], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        Ok(rows
            .into_iter()
            .filter_map(|row| decode_logged(stage, row))
            .filter_map(|artifact| {
                let chat_id = artifact.source_chat_id.clone()?;
                Some((chat_id, artifact))
            })
            .collect())
    }

    /// Every stored version of a key, newest first.
    pub fn history(
        &self,
        stage: Stage,
        chat_id: Option<&str>,
    ) -> Result<Vec<CheckpointVersion>, CheckpointError> {
        let key = key_for(stage, chat_id)?;
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, stage, chat_id, created_at, payload
                FROM checkpoints
                WHERE stage = ?1 AND chat_id = ?2
                ORDER BY id DESC
                "#,
            )?;
            let rows = stmt
                .query_map(params![stage.as_str(), key], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        Ok(rows
            .into_iter()
            .map(|row| {
                let id = row.id;
                let created_at = row.created_at.clone();
                let readable = decode(stage, row).is_ok();
                CheckpointVersion {
                    id,
                    stage,
                    chat_id: chat_id.map(str::to_string),
                    created_at,
                    readable,
                }
            })
            .collect())
    }

    /// Per-stage counts for status output.
    pub fn overview(&self) -> Result<Vec<StageCheckpoints>, CheckpointError> {
        let conn = self.lock()?;
        let mut overview = Vec::new();
        for stage in Stage::ALL {
            let (keys, versions, latest_at): (i64, i64, Option<String>) = conn.query_row(
                r#"
                SELECT COUNT(DISTINCT chat_id), COUNT(*), MAX(created_at)
                FROM checkpoints WHERE stage = ?1
                "#,
                params![stage.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            overview.push(StageCheckpoints {
                stage,
                keys: keys as usize,
                versions: versions as usize,
                latest_at,
            });
        }
        Ok(overview)
    }

    /// Delete every version of a stage, or of all stages.
    pub fn clear(&self, stage: Option<Stage>) -> Result<usize, CheckpointError> {
        let conn = self.lock()?;
        let affected = match stage {
            Some(stage) => conn.execute(
                "DELETE FROM checkpoints WHERE stage = ?1",
                params![stage.as_str()],
            )?,
            None => conn.execute("DELETE FROM checkpoints", [])?,
        };
        tracing::info!(stage = ?stage, affected, "Checkpoints cleared");
        Ok(affected)
    }
}

fn key_for(stage: Stage, chat_id: Option<&str>) -> Result<String, CheckpointError> {
    match (stage.is_per_chat(), chat_id) {
        (true, Some(id)) if !id.is_empty() => Ok(id.to_string()),
        (true, _) => Err(CheckpointError::InvalidKey(format!(
            "{} checkpoints need a chat id",
            stage
        ))),
        (false, None) => Ok(String::new()),
        (false, Some(id)) => Err(CheckpointError::InvalidKey(format!(
            "{} is an aggregate stage, got chat id {}",
            stage, id
        ))),
    }
}

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(0)?,
        stage: row.get(1)?,
        chat_id: row.get(2)?,
        created_at: row.get(3)?,
        payload: row.get(4)?,
    })
}

fn decode_logged(stage: Stage, row: StoredRow) -> Option<Artifact> {
    let id = row.id;
    let chat_id = row.chat_id.clone();
    match decode(stage, row) {
        Ok(artifact) => Some(artifact),
        Err(reason) => {
            tracing::warn!(
                stage = %stage,
                chat_id = %chat_id,
                id,
                reason = %reason,
                "Corrupt checkpoint treated as absent"
            );
            None
        }
    }
}

fn decode(stage: Stage, row: StoredRow) -> Result<Artifact, String> {
    if row.stage != stage.as_str() {
        return Err(format!("row stage '{}' does not match", row.stage));
    }
    let created_at = parse_timestamp(&row.created_at)
        .ok_or_else(|| format!("unreadable timestamp '{}'", row.created_at))?;
    let payload: StagePayload =
        serde_json::from_str(&row.payload).map_err(|e| format!("unreadable payload: {}", e))?;
    if payload.stage() != stage {
        return Err(format!("payload is tagged {}", payload.stage()));
    }

    let source_chat_id = if row.chat_id.is_empty() {
        None
    } else {
        Some(row.chat_id)
    };
    if source_chat_id.is_some() != stage.is_per_chat() {
        return Err("chat id does not match stage granularity".to_string());
    }

    Ok(Artifact {
        id: row.id,
        stage,
        source_chat_id,
        created_at,
        payload,
    })
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ChatMessage, Topic};
    use crate::state::{AnalyzePayload, CollectPayload};
    use tokio_test::{assert_err, assert_ok};

    fn store() -> CheckpointStore {
        CheckpointStore::new(&PipelineDb::open_in_memory().unwrap())
    }

    fn collect(chat_id: &str, texts: &[&str]) -> StagePayload {
        StagePayload::Collect(CollectPayload {
            chat_id: chat_id.to_string(),
            title: None,
            messages: texts
                .iter()
                .map(|t| ChatMessage {
                    author: "alice".into(),
                    timestamp: DateTime::<Utc>::UNIX_EPOCH,
                    text: t.to_string(),
                })
                .collect(),
        })
    }

    fn raw_insert(store: &CheckpointStore, stage: &str, chat_id: &str, created_at: &str, payload: &str) {
        let conn = store.lock().unwrap();
        conn.execute(
            "INSERT INTO checkpoints (stage, chat_id, created_at, payload) VALUES (?1, ?2, ?3, ?4)",
            params![stage, chat_id, created_at, payload],
        )
        .unwrap();
    }

    #[test]
    fn test_put_then_get() {
        let store = store();
        let written = store.put(collect("a", &["hello there"]), Some("a")).unwrap();
        let read = store.get(Stage::Collect, Some("a")).unwrap();

        assert_eq!(read, written);
        assert_eq!(read.source_chat_id.as_deref(), Some("a"));
        assert!(store.exists(Stage::Collect, Some("a")));
    }

    #[test]
    fn test_get_missing() {
        let store = store();
        let err = store.get(Stage::Adapt, None).unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.exists(Stage::Adapt, None));
    }

    #[test]
    fn test_put_twice_same_payload() {
        let store = store();
        let first = store.put(collect("a", &["same"]), Some("a")).unwrap();
        let second = store.put(collect("a", &["same"]), Some("a")).unwrap();

        assert_ne!(first.created_at, second.created_at);
        assert!(second.is_newer_than(&first));

        let latest = store.get(Stage::Collect, Some("a")).unwrap();
        assert_eq!(latest.payload, first.payload);
        assert_eq!(latest.payload, second.payload);
        assert_eq!(latest.id, second.id);
        assert_eq!(store.history(Stage::Collect, Some("a")).unwrap().len(), 2);
    }

    #[test]
    fn test_latest_version_wins() {
        let store = store();
        store.put(collect("a", &["old"]), Some("a")).unwrap();
        store.put(collect("a", &["new"]), Some("a")).unwrap();

        let latest = store.get(Stage::Collect, Some("a")).unwrap();
        let payload = latest.as_collect().unwrap();
        assert_eq!(payload.messages[0].text, "new");
    }

    #[test]
    fn test_corrupt_payload_reads_as_absent() {
        let store = store();
        store.put(collect("a", &["valid"]), Some("a")).unwrap();
        raw_insert(&store, "collect", "a", "2099-01-01T00:00:00.000000000Z", "{not json");

        assert!(store.get(Stage::Collect, Some("a")).unwrap_err().is_not_found());
        assert!(!store.exists(Stage::Collect, Some("a")));
        assert!(store.list_chat_ids(Stage::Collect).unwrap().is_empty());

        let history = store.history(Stage::Collect, Some("a")).unwrap();
        assert!(!history[0].readable);
        assert!(history[1].readable);
    }

    #[test]
    fn test_mismatched_payload_reads_as_absent() {
        let store = store();
        let json = serde_json::to_string(&collect("a", &["x"])).unwrap();
        raw_insert(&store, "analyze", "a", "2024-01-01T00:00:00.000000000Z", &json);
        raw_insert(&store, "collect", "b", "not a time", &json);

        assert!(!store.exists(Stage::Analyze, Some("a")));
        assert!(!store.exists(Stage::Collect, Some("b")));
    }

    #[test]
    fn test_created_at_stays_monotonic() {
        let store = store();
        let json = serde_json::to_string(&collect("a", &["x"])).unwrap();
        raw_insert(&store, "collect", "a", "2099-01-01T00:00:00.000000000Z", &json);

        let written = store.put(collect("b", &["y"]), Some("b")).unwrap();
        let future = store.get(Stage::Collect, Some("a")).unwrap();
        assert!(written.is_newer_than(&future));
    }

    #[test]
    fn test_unparsable_timestamp_keeps_created_at_monotonic() {
        let store = store();
        let json = serde_json::to_string(&collect("a", &["x"])).unwrap();
        raw_insert(&store, "collect", "a", "2099-01-01T00:00:00.000000000Z", &json);
        raw_insert(&store, "collect", "c", "not a time", &json);

        let written = assert_ok!(store.put(collect("b", &["y"]), Some("b")));
        let future = store.get(Stage::Collect, Some("a")).unwrap();
        assert!(written.is_newer_than(&future));
    }

    #[test]
    fn test_list_chat_ids() {
        let store = store();
        store.put(collect("b", &["x"]), Some("b")).unwrap();
        store.put(collect("a", &["x"]), Some("a")).unwrap();
        store.put(collect("a", &["y"]), Some("a")).unwrap();

        let ids: Vec<_> = store.list_chat_ids(Stage::Collect).unwrap().into_iter().collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(store.list_chat_ids(Stage::Analyze).unwrap().is_empty());
        assert_err!(store.list_chat_ids(Stage::Cluster));
    }

    #[test]
    fn test_key_validation() {
        let store = store();
        assert!(matches!(
            store.put(collect("a", &["x"]), None),
            Err(CheckpointError::InvalidKey(_))
        ));

        let analysis = StagePayload::Analyze(AnalyzePayload {
            chat_id: "a".into(),
            analyzed_messages: 1,
            analysis: crate::services::ChatAnalysis {
                topics: vec![Topic {
                    name: "Cooking".into(),
                    keywords: vec!["pasta".into()],
                    percentage: 100.0,
                    description: String::new(),
                }],
                ..Default::default()
            },
        });
        assert_ok!(store.put(analysis, Some("a")));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");

        let written = {
            let store = CheckpointStore::new(&PipelineDb::open_at(&path).unwrap());
            store.put(collect("a", &["persisted"]), Some("a")).unwrap()
        };

        let store = CheckpointStore::new(&PipelineDb::open_at(&path).unwrap());
        let read = store.get(Stage::Collect, Some("a")).unwrap();
        assert_eq!(read.payload, written.payload);
        assert_eq!(read.created_at, written.created_at);
    }

    #[test]
    fn test_clear_stage() {
        let store = store();
        store.put(collect("a", &["x"]), Some("a")).unwrap();
        assert_eq!(store.clear(Some(Stage::Collect)).unwrap(), 1);
        assert!(!store.exists(Stage::Collect, Some("a")));
    }
}
