//! Typed memory records and the vector-store adapter.
//!
//! The persistent vector store itself is an external collaborator; this
//! module defines the contract it must satisfy (`VectorIndex`), the record
//! type stored in it, and the `MemoryStore` adapter the rest of the core
//! talks to. An in-memory cosine index ships for tests and for deployments
//! without a configured backend.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{NexusError, NexusResult};
use crate::util::short_id;

/// Fixed embedding dimensionality (all-MiniLM-class sentence encoders).
pub const EMBEDDING_DIM: usize = 384;

/// Attempts made against a retryable store fault before giving up.
const STORE_RETRIES: u32 = 3;

/// Classification of a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Free-form conversational output.
    Conversation,
    /// A code snippet.
    Code,
    /// A captured file change.
    FileChange,
    /// The outcome of an orchestrated task.
    TaskResult,
    /// An agent's reasoning trace.
    Thought,
    /// Anything else.
    Generic,
    /// Raw agent stdout/stderr capture.
    AgentOutput,
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryType::Conversation => "conversation",
            MemoryType::Code => "code",
            MemoryType::FileChange => "file_change",
            MemoryType::TaskResult => "task_result",
            MemoryType::Thought => "thought",
            MemoryType::Generic => "generic",
            MemoryType::AgentOutput => "agent_output",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for MemoryType {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(MemoryType::Conversation),
            "code" => Ok(MemoryType::Code),
            "file_change" => Ok(MemoryType::FileChange),
            "task_result" => Ok(MemoryType::TaskResult),
            "thought" => Ok(MemoryType::Thought),
            "generic" => Ok(MemoryType::Generic),
            "agent_output" => Ok(MemoryType::AgentOutput),
            other => Err(NexusError::InvalidInput(format!(
                "unknown memory type: {other}"
            ))),
        }
    }
}

/// A single memory record.
///
/// Content is immutable once stored; superseding content creates a new
/// record carrying a `supersedes` back-reference in its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Opaque 8-char identifier.
    pub id: String,
    /// The stored text.
    pub content: String,
    /// Producer of the record: an agent name, `system`, or `user`.
    pub source: String,
    /// Owning session. Never empty once stored.
    pub session_id: String,
    /// Record classification.
    pub memory_type: MemoryType,
    /// Free-form metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Embedding vector; exactly `EMBEDDING_DIM` floats once stored.
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    /// Build a record with a fresh id and the current timestamp.
    pub fn new(
        content: impl Into<String>,
        source: impl Into<String>,
        session_id: impl Into<String>,
        memory_type: MemoryType,
    ) -> Self {
        Self {
            id: short_id(),
            content: content.into(),
            source: source.into(),
            session_id: session_id.into(),
            memory_type,
            metadata: HashMap::new(),
            embedding: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a metadata entry, consuming and returning the record.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Text-to-vector embedding contract. External collaborator.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into an `EMBEDDING_DIM`-dimensional vector.
    async fn embed(&self, text: &str) -> NexusResult<Vec<f32>>;
}

/// Predicate applied to records in index operations.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Match a specific record id.
    pub id: Option<String>,
    /// Match a session.
    pub session_id: Option<String>,
    /// Match a record type.
    pub memory_type: Option<MemoryType>,
}

impl RecordFilter {
    /// Filter on a record id alone.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Filter on a session id alone.
    pub fn by_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(id) = &self.id {
            if record.id != *id {
                return false;
            }
        }
        if let Some(session) = &self.session_id {
            if record.session_id != *session {
                return false;
            }
        }
        if let Some(kind) = self.memory_type {
            if record.memory_type != kind {
                return false;
            }
        }
        true
    }
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total records stored.
    pub total: usize,
    /// Distinct sessions represented.
    pub sessions: usize,
    /// Record counts per memory type.
    pub type_counts: HashMap<String, usize>,
}

/// Contract the external vector store must satisfy.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace a record.
    async fn upsert(&self, record: MemoryRecord) -> NexusResult<()>;

    /// Nearest-neighbour search by cosine distance, ascending; ties broken
    /// by descending timestamp.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> NexusResult<Vec<MemoryRecord>>;

    /// List matching records in descending timestamp order.
    async fn scan(&self, filter: &RecordFilter, limit: usize) -> NexusResult<Vec<MemoryRecord>>;

    /// Delete matching records, returning how many were removed.
    async fn delete(&self, filter: &RecordFilter) -> NexusResult<usize>;

    /// Aggregate statistics.
    async fn stats(&self) -> NexusResult<StoreStats>;
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Reference `VectorIndex` kept entirely in memory.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: RwLock<Vec<MemoryRecord>>,
}

impl InMemoryVectorIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, record: MemoryRecord) -> NexusResult<()> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
        } else {
            records.push(record);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> NexusResult<Vec<MemoryRecord>> {
        let records = self.records.read().await;
        let mut scored: Vec<(f32, &MemoryRecord)> = records
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| (cosine_distance(vector, &r.embedding), r))
            .collect();
        scored.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| b.1.timestamp.cmp(&a.1.timestamp))
        });
        Ok(scored.into_iter().take(k).map(|(_, r)| r.clone()).collect())
    }

    async fn scan(&self, filter: &RecordFilter, limit: usize) -> NexusResult<Vec<MemoryRecord>> {
        let records = self.records.read().await;
        let mut matched: Vec<&MemoryRecord> =
            records.iter().filter(|r| filter.matches(r)).collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matched.into_iter().take(limit).cloned().collect())
    }

    async fn delete(&self, filter: &RecordFilter) -> NexusResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| !filter.matches(r));
        Ok(before - records.len())
    }

    async fn stats(&self) -> NexusResult<StoreStats> {
        let records = self.records.read().await;
        let sessions: HashSet<&str> = records.iter().map(|r| r.session_id.as_str()).collect();
        let mut type_counts: HashMap<String, usize> = HashMap::new();
        for record in records.iter() {
            *type_counts.entry(record.memory_type.to_string()).or_insert(0) += 1;
        }
        Ok(StoreStats {
            total: records.len(),
            sessions: sessions.len(),
            type_counts,
        })
    }
}

async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> NexusResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NexusResult<T>>,
{
    let mut delay = Duration::from_millis(50);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < STORE_RETRIES => {
                warn!(%err, attempt, "retrying {what} after store fault");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Adapter between the core and the vector store.
pub struct MemoryStore {
    index: Arc<dyn VectorIndex>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl MemoryStore {
    /// Wrap an index, optionally with an embedder.
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { index, embedder }
    }

    /// Store backed by the in-memory index, with no embedder: `add` stores
    /// zero vectors and `search` degenerates to a chronological filter.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryVectorIndex::new()), None)
    }

    /// Validate and store a record, returning its id.
    pub async fn add(&self, mut record: MemoryRecord) -> NexusResult<String> {
        if record.session_id.is_empty() {
            return Err(NexusError::InvalidRecord(
                "record has no session id".to_string(),
            ));
        }
        if record.embedding.is_empty() {
            record.embedding = match &self.embedder {
                Some(embedder) => embedder.embed(&record.content).await?,
                None => vec![0.0; EMBEDDING_DIM],
            };
        }
        if record.embedding.len() != EMBEDDING_DIM {
            return Err(NexusError::InvalidRecord(format!(
                "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                record.embedding.len()
            )));
        }

        let id = record.id.clone();
        with_retry("upsert", || self.index.upsert(record.clone())).await?;
        debug!(record = %id, session = %record.session_id, kind = %record.memory_type, "stored memory record");
        Ok(id)
    }

    /// Store a replacement for `old_id`; the old record stays untouched and
    /// the new one carries a `supersedes` back-reference.
    pub async fn supersede(&self, old_id: &str, record: MemoryRecord) -> NexusResult<String> {
        self.add(record.with_metadata("supersedes", serde_json::Value::String(old_id.to_string())))
            .await
    }

    /// Semantic search, nearest first. Without an embedder this is a
    /// chronological filter.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        session_filter: Option<&str>,
        type_filter: Option<MemoryType>,
    ) -> NexusResult<Vec<MemoryRecord>> {
        let filter = RecordFilter {
            id: None,
            session_id: session_filter.map(str::to_string),
            memory_type: type_filter,
        };
        match &self.embedder {
            Some(embedder) => {
                let vector = embedder.embed(query).await?;
                with_retry("search", || self.index.search(&vector, limit, &filter)).await
            }
            None => with_retry("scan", || self.index.scan(&filter, limit)).await,
        }
    }

    /// List a session's records, newest first.
    pub async fn by_session(
        &self,
        session_id: &str,
        memory_type: Option<MemoryType>,
        limit: usize,
    ) -> NexusResult<Vec<MemoryRecord>> {
        let filter = RecordFilter {
            id: None,
            session_id: Some(session_id.to_string()),
            memory_type,
        };
        with_retry("scan", || self.index.scan(&filter, limit)).await
    }

    /// Delete one record by id. Returns whether anything was removed.
    pub async fn delete(&self, id: &str) -> NexusResult<bool> {
        let filter = RecordFilter::by_id(id);
        let removed = with_retry("delete", || self.index.delete(&filter)).await?;
        Ok(removed > 0)
    }

    /// Delete every record of a session, returning the count removed.
    pub async fn clear_session(&self, session_id: &str) -> NexusResult<usize> {
        let filter = RecordFilter::by_session(session_id);
        with_retry("delete", || self.index.delete(&filter)).await
    }

    /// Aggregate statistics.
    pub async fn stats(&self) -> NexusResult<StoreStats> {
        with_retry("stats", || self.index.stats()).await
    }
}
