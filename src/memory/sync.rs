//! Real-time memory synchronization.
//!
//! Every stored memory record becomes a `SyncEvent` fanned out on its
//! session's topic. Delivery is at-least-once within the process through
//! bounded per-subscriber queues; a subscriber that falls behind loses the
//! oldest events and is flagged lossy rather than ever blocking the
//! publisher. An optional Redis bridge mirrors the same payloads on
//! `memnexus:session:<id>` for cross-instance fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::NexusResult;
use crate::memory::store::{MemoryRecord, MemoryStore, MemoryType};

/// What happened to the embedded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    /// A new record was stored.
    Created,
    /// A record was superseded.
    Updated,
    /// A record was removed.
    Deleted,
}

/// Immutable change notification about a memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: SyncEventKind,
    /// Session the record belongs to.
    pub session_id: String,
    /// The record itself.
    pub memory: MemoryRecord,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Which agent or subsystem produced the event.
    pub source: String,
}

impl SyncEvent {
    /// Build an event around a record; the session id is taken from it.
    pub fn new(kind: SyncEventKind, memory: MemoryRecord, source: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: memory.session_id.clone(),
            memory,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    /// Serialize for the distributed sync topic.
    pub fn to_json(&self) -> NexusResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Callback invoked for each delivered event.
pub type SyncCallback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Handle to an active subscription. Dropping it unsubscribes.
pub struct Subscription {
    session_id: String,
    lossy: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Session topic this subscription is attached to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether this subscriber has ever overflowed its queue.
    pub fn is_lossy(&self) -> bool {
        self.lossy.load(Ordering::Relaxed)
    }

    /// Explicitly tear the subscription down.
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Optional Redis fan-out for multi-instance deployments.
pub struct RedisBridge {
    conn: ConnectionManager,
}

impl RedisBridge {
    /// Connect the bridge. Fails fast so a misconfigured URL is visible at
    /// startup rather than at first publish.
    pub async fn connect(url: &str) -> NexusResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    /// Publish a serialized event. Failures are logged, never propagated.
    pub async fn publish(&self, session_id: &str, payload: String) {
        let mut conn = self.conn.clone();
        let topic = format!("memnexus:session:{session_id}");
        if let Err(err) = conn.publish::<_, _, ()>(&topic, payload).await {
            warn!(%err, %topic, "failed to publish sync event to broker");
        }
    }
}

/// Per-session pub/sub bus for memory events.
pub struct MemorySyncBus {
    capacity: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<SyncEvent>>>,
    broker: Option<RedisBridge>,
}

impl MemorySyncBus {
    /// Bus with the given per-subscriber queue capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: RwLock::new(HashMap::new()),
            broker: None,
        }
    }

    /// Attach a distributed broker bridge.
    pub fn with_broker(mut self, broker: RedisBridge) -> Self {
        self.broker = Some(broker);
        self
    }

    async fn topic(&self, session_id: &str) -> broadcast::Sender<SyncEvent> {
        if let Some(tx) = self.topics.read().await.get(session_id) {
            return tx.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Register a callback on a session topic.
    ///
    /// The callback runs on a dedicated receiver task so it can never block
    /// publishers. If the subscriber's queue overflows, the oldest events
    /// are discarded and the subscription is flagged lossy.
    pub async fn subscribe(&self, session_id: &str, callback: SyncCallback) -> Subscription {
        let mut rx = self.topic(session_id).await.subscribe();
        let lossy = Arc::new(AtomicBool::new(false));
        let lossy_flag = Arc::clone(&lossy);
        let topic = session_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        lossy_flag.store(true, Ordering::Relaxed);
                        warn!(%topic, skipped, "sync subscriber overflowed, dropped oldest events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription {
            session_id: session_id.to_string(),
            lossy,
            handle,
        }
    }

    /// Publish an event to local subscribers and, if wired, the broker.
    pub async fn publish(&self, event: SyncEvent) {
        let tx = self.topic(&event.session_id).await;
        // A send error only means nobody is subscribed right now.
        let delivered = tx.send(event.clone()).unwrap_or(0);
        debug!(
            session = %event.session_id,
            source = %event.source,
            subscribers = delivered,
            "published sync event"
        );

        if let Some(broker) = &self.broker {
            match event.to_json() {
                Ok(payload) => broker.publish(&event.session_id, payload).await,
                Err(err) => warn!(%err, "failed to serialize sync event for broker"),
            }
        }
    }

    /// Drop a session's topic entirely.
    pub async fn remove_topic(&self, session_id: &str) {
        self.topics.write().await.remove(session_id);
    }
}

/// Binds one agent's output to a session's memory and sync path.
#[derive(Clone)]
pub struct AgentMemoryBridge {
    session_id: String,
    agent_name: String,
    store: Arc<MemoryStore>,
    bus: Arc<MemorySyncBus>,
}

impl AgentMemoryBridge {
    /// Build a bridge for one agent in one session.
    pub fn new(
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        store: Arc<MemoryStore>,
        bus: Arc<MemorySyncBus>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_name: agent_name.into(),
            store,
            bus,
        }
    }

    /// Store agent output and fan it out, returning the record id.
    pub async fn capture_output(
        &self,
        content: impl Into<String>,
        memory_type: MemoryType,
    ) -> NexusResult<String> {
        let record = MemoryRecord::new(
            content,
            self.agent_name.clone(),
            self.session_id.clone(),
            memory_type,
        );
        let id = self.store.add(record.clone()).await?;
        self.bus
            .publish(SyncEvent::new(
                SyncEventKind::Created,
                record,
                self.agent_name.clone(),
            ))
            .await;
        Ok(id)
    }

    /// Capture a file change with a `[KIND] path` header; content is
    /// truncated to its first 1000 characters.
    pub async fn capture_file_change(
        &self,
        file_path: &str,
        change_type: &str,
        content: Option<&str>,
    ) -> NexusResult<String> {
        let mut text = format!("[{}] {file_path}", change_type.to_uppercase());
        if let Some(content) = content {
            text.push('\n');
            text.push_str(crate::util::truncate_chars(content, 1000));
        }
        let record = MemoryRecord::new(
            text,
            self.agent_name.clone(),
            self.session_id.clone(),
            MemoryType::FileChange,
        )
        .with_metadata("file_path", serde_json::Value::String(file_path.into()))
        .with_metadata("change_type", serde_json::Value::String(change_type.into()));
        let id = self.store.add(record.clone()).await?;
        self.bus
            .publish(SyncEvent::new(
                SyncEventKind::Created,
                record,
                self.agent_name.clone(),
            ))
            .await;
        Ok(id)
    }

    /// Capture a reasoning trace.
    pub async fn capture_thought(&self, thought: impl Into<String>) -> NexusResult<String> {
        self.capture_output(thought, MemoryType::Thought).await
    }

    /// Build an output callback suitable for the supervisor's hook.
    pub fn output_callback(&self) -> Arc<dyn Fn(String) + Send + Sync> {
        let bridge = self.clone();
        Arc::new(move |line: String| {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                if let Err(err) = bridge.capture_output(line, MemoryType::AgentOutput).await {
                    warn!(%err, agent = %bridge.agent_name, "failed to capture agent output");
                }
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn event(session: &str, content: &str) -> SyncEvent {
        SyncEvent::new(
            SyncEventKind::Created,
            MemoryRecord::new(content, "system", session, MemoryType::Generic),
            "system",
        )
    }

    #[tokio::test]
    async fn events_are_delivered_once_in_publish_order() {
        let bus = MemorySyncBus::new(16);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus
            .subscribe(
                "sess1",
                Arc::new(move |ev: SyncEvent| sink.lock().unwrap().push(ev.memory.content)),
            )
            .await;

        for i in 0..3 {
            bus.publish(event("sess1", &format!("m{i}"))).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["m0", "m1", "m2"]);
        assert!(!sub.is_lossy());
    }

    #[tokio::test]
    async fn topics_are_isolated_per_session() {
        let bus = MemorySyncBus::new(16);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus
            .subscribe(
                "sess1",
                Arc::new(move |ev: SyncEvent| sink.lock().unwrap().push(ev.session_id)),
            )
            .await;

        bus.publish(event("sess2", "other")).await;
        bus.publish(event("sess1", "mine")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["sess1"]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_flags_lossy() {
        let bus = MemorySyncBus::new(2);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus
            .subscribe(
                "sess1",
                Arc::new(move |ev: SyncEvent| sink.lock().unwrap().push(ev.memory.content)),
            )
            .await;

        // Publish faster than the subscriber task can drain: five events
        // into a queue of two.
        for i in 0..5 {
            bus.publish(event("sess1", &format!("m{i}"))).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap();
        assert!(sub.is_lossy());
        assert!(seen.len() < 5);
        // Whatever survived is the newest tail, in order.
        assert_eq!(*seen, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let bus = MemorySyncBus::new(16);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus
            .subscribe(
                "sess1",
                Arc::new(move |ev: SyncEvent| sink.lock().unwrap().push(ev.memory.content)),
            )
            .await;

        bus.publish(event("sess1", "before")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        sub.cancel();
        bus.publish(event("sess1", "after")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["before"]);
    }

    #[tokio::test]
    async fn bridge_captures_output_through_store_and_bus() {
        let store = Arc::new(MemoryStore::in_memory());
        let bus = Arc::new(MemorySyncBus::new(16));
        let seen: Arc<Mutex<Vec<SyncEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus
            .subscribe(
                "sess1",
                Arc::new(move |ev: SyncEvent| sink.lock().unwrap().push(ev)),
            )
            .await;

        let bridge = AgentMemoryBridge::new("sess1", "claude", Arc::clone(&store), Arc::clone(&bus));
        let id = bridge
            .capture_output("built the API", MemoryType::Conversation)
            .await
            .unwrap();

        let stored = store.by_session("sess1", None, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].source, "claude");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SyncEventKind::Created);
        assert_eq!(events[0].source, "claude");
    }

    #[tokio::test]
    async fn file_change_capture_truncates_and_tags() {
        let store = Arc::new(MemoryStore::in_memory());
        let bus = Arc::new(MemorySyncBus::new(16));
        let bridge = AgentMemoryBridge::new("sess1", "claude", Arc::clone(&store), bus);

        let long = "x".repeat(2000);
        bridge
            .capture_file_change("src/main.rs", "modified", Some(&long))
            .await
            .unwrap();

        let stored = store.by_session("sess1", Some(MemoryType::FileChange), 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].content.starts_with("[MODIFIED] src/main.rs"));
        assert!(stored[0].content.len() <= "[MODIFIED] src/main.rs\n".len() + 1000);
        assert_eq!(
            stored[0].metadata.get("change_type"),
            Some(&serde_json::Value::String("modified".into()))
        );
    }

    #[test]
    fn sync_event_wire_shape() {
        let ev = event("sess1", "hello");
        let json = ev.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "created");
        assert_eq!(value["session_id"], "sess1");
        assert_eq!(value["memory"]["content"], "hello");
        assert!(value["timestamp"].is_string());
        assert_eq!(value["source"], "system");
    }
}
