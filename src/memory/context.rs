//! Per-session context over the shared memory store.
//!
//! The context manager is how the rest of the core writes memories: every
//! capture goes through the store and is fanned out on the session's sync
//! topic in the same call.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::NexusResult;
use crate::memory::store::{MemoryRecord, MemoryStore, MemoryType};
use crate::memory::sync::{MemorySyncBus, SyncEvent, SyncEventKind};

/// A point-in-time view of a session's memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Owning session.
    pub session_id: String,
    /// Most recent records, newest first.
    pub recent_memories: Vec<MemoryRecord>,
    /// Records most relevant to the query.
    pub relevant_memories: Vec<MemoryRecord>,
    /// One-line description of what the session holds.
    pub summary: String,
}

/// Coordinates memory storage and retrieval for one session.
pub struct ContextManager {
    session_id: String,
    store: Arc<MemoryStore>,
    bus: Arc<MemorySyncBus>,
}

impl ContextManager {
    /// Build a context manager over the shared store and bus.
    pub fn new(session_id: impl Into<String>, store: Arc<MemoryStore>, bus: Arc<MemorySyncBus>) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            bus,
        }
    }

    /// Session this manager belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn capture(&self, record: MemoryRecord) -> NexusResult<String> {
        let source = record.source.clone();
        let id = self.store.add(record.clone()).await?;
        self.bus
            .publish(SyncEvent::new(SyncEventKind::Created, record, source))
            .await;
        Ok(id)
    }

    /// Store agent output as a memory record, returning its id.
    pub async fn store_agent_output(
        &self,
        agent: &str,
        content: impl Into<String>,
        memory_type: MemoryType,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> NexusResult<String> {
        let mut record = MemoryRecord::new(content, agent, self.session_id.clone(), memory_type);
        if let Some(metadata) = metadata {
            record.metadata = metadata;
        }
        self.capture(record).await
    }

    /// Store a file change, content truncated to its first 1000 chars.
    pub async fn store_file_change(
        &self,
        agent: &str,
        file_path: &str,
        change_type: &str,
        content: Option<&str>,
    ) -> NexusResult<String> {
        let mut text = format!("[{}] {file_path}", change_type.to_uppercase());
        if let Some(content) = content {
            text.push('\n');
            text.push_str(crate::util::truncate_chars(content, 1000));
        }
        let metadata = HashMap::from([
            (
                "file_path".to_string(),
                serde_json::Value::String(file_path.to_string()),
            ),
            (
                "change_type".to_string(),
                serde_json::Value::String(change_type.to_string()),
            ),
        ]);
        self.store_agent_output(agent, text, MemoryType::FileChange, Some(metadata))
            .await
    }

    /// Store the outcome of a task.
    pub async fn store_task_result(
        &self,
        agent: &str,
        task: &str,
        result: &str,
        success: bool,
    ) -> NexusResult<String> {
        let content = format!("Task: {task}\nResult: {result}");
        let metadata = HashMap::from([
            ("task".to_string(), serde_json::Value::String(task.to_string())),
            ("success".to_string(), serde_json::Value::Bool(success)),
        ]);
        self.store_agent_output(agent, content, MemoryType::TaskResult, Some(metadata))
            .await
    }

    /// Retrieve context for a query: semantically relevant records plus the
    /// most recent ones, with a summary of what the session holds.
    pub async fn get_context(&self, query: &str, limit: usize) -> NexusResult<ContextSnapshot> {
        let relevant = self
            .store
            .search(query, limit, Some(&self.session_id), None)
            .await?;
        let recent = self.store.by_session(&self.session_id, None, 20).await?;
        let summary = Self::summarize(&recent);
        debug!(session = %self.session_id, relevant = relevant.len(), recent = recent.len(), "assembled context snapshot");

        Ok(ContextSnapshot {
            session_id: self.session_id.clone(),
            recent_memories: recent.into_iter().take(10).collect(),
            relevant_memories: relevant,
            summary,
        })
    }

    /// Conversation records in chronological order.
    pub async fn conversation_history(&self, limit: usize) -> NexusResult<Vec<MemoryRecord>> {
        let mut history = self
            .store
            .by_session(&self.session_id, Some(MemoryType::Conversation), limit)
            .await?;
        history.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(history)
    }

    /// Drop every record of this session, returning how many were removed.
    pub async fn clear(&self) -> NexusResult<usize> {
        self.store.clear_session(&self.session_id).await
    }

    fn summarize(recent: &[MemoryRecord]) -> String {
        if recent.is_empty() {
            return "No context available.".to_string();
        }

        let mut sources: HashMap<&str, usize> = HashMap::new();
        let mut types: HashMap<String, usize> = HashMap::new();
        for record in recent {
            *sources.entry(record.source.as_str()).or_insert(0) += 1;
            *types.entry(record.memory_type.to_string()).or_insert(0) += 1;
        }

        let mut source_parts: Vec<String> =
            sources.iter().map(|(k, v)| format!("{k}({v})")).collect();
        source_parts.sort();
        let mut type_parts: Vec<String> = types.iter().map(|(k, v)| format!("{k}({v})")).collect();
        type_parts.sort();

        format!(
            "Session has {} recent memories from {} sources. Sources: {}. Types: {}.",
            recent.len(),
            sources.len(),
            source_parts.join(", "),
            type_parts.join(", ")
        )
    }
}
