//! ACP connection handling: JSON-RPC 2.0 over an agent's stdio.
//!
//! One reader task per connection routes inbound traffic; outbound writes
//! share a mutex so concurrent calls never interleave bytes. Prompts on a
//! connection are serialized behind a gate, and each prompt stream carries
//! its own hard deadline. Peer-initiated `tools/call` requests are served
//! concurrently with outbound prompts from a registered handler map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProtocolSettings;
use crate::error::{NexusError, NexusResult};
use crate::memory::context::ContextManager;
use crate::memory::store::MemoryType;
use crate::protocol::message::{
    self, capabilities, classify, error_response, id_key, method, notification, request, response,
    ClientInfo, Incoming, PromptEvent, INTERNAL_ERROR, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};

/// Async tool handler invoked for peer-initiated `tools/call` requests.
pub type ToolHandler =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, NexusResult<Value>> + Send + Sync>;

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<NexusResult<Value>>>>>;

enum ReaderEvent {
    Peer(Value),
    Closed,
}

/// A JSON-RPC session over one agent's stdio streams.
pub struct AcpConnection {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: PendingMap,
    tools: Arc<RwLock<HashMap<String, ToolHandler>>>,
    events_rx: Arc<Mutex<UnboundedReceiver<ReaderEvent>>>,
    prompt_gate: Arc<Mutex<()>>,
    next_id: AtomicU64,
    initialized: AtomicBool,
    reader: StdMutex<Option<JoinHandle<()>>>,
    settings: ProtocolSettings,
    client_info: ClientInfo,
}

impl AcpConnection {
    /// Wrap a reader/writer pair (normally the agent's stdout/stdin).
    ///
    /// The reader task starts immediately; the handshake does not happen
    /// until [`initialize`](Self::initialize) is called, and every other
    /// outbound operation fails with `NotInitialized` until it completes.
    pub fn new<R, W>(reader: R, writer: W, settings: ProtocolSettings) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let tools: Arc<RwLock<HashMap<String, ToolHandler>>> = Arc::new(RwLock::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>> =
            Arc::new(Mutex::new(Box::new(writer)));

        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&writer),
            Arc::clone(&pending),
            Arc::clone(&tools),
            events_tx,
        ));

        Self {
            writer,
            pending,
            tools,
            events_rx: Arc::new(Mutex::new(events_rx)),
            prompt_gate: Arc::new(Mutex::new(())),
            next_id: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            reader: StdMutex::new(Some(reader_task)),
            settings,
            client_info: ClientInfo::default(),
        }
    }

    /// Register a tool handler. The core registers `memory_search` and
    /// `memory_store`; callers may add their own before the handshake.
    pub async fn register_tool(&self, name: impl Into<String>, handler: ToolHandler) {
        self.tools.write().await.insert(name.into(), handler);
    }

    /// Run the handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(&self) -> NexusResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": capabilities(),
            "clientInfo": {
                "name": self.client_info.name,
                "version": self.client_info.version,
            },
        });
        let peer_caps = self.send_request(method::INITIALIZE, params).await?;
        debug!(?peer_caps, "peer capabilities received");

        self.write_value(&notification(method::INITIALIZED, json!({})))
            .await?;
        self.initialized.store(true, Ordering::SeqCst);
        info!("ACP handshake complete");
        Ok(())
    }

    /// Whether the handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Send a prompt and stream the peer's events until completion.
    ///
    /// Prompts on one connection are serialized: the returned stream holds
    /// the prompt gate until it is dropped. Dropping the stream mid-flight
    /// cancels only this prompt; other in-flight calls are unaffected.
    pub async fn send_prompt(
        &self,
        prompt: &str,
        context: Option<Value>,
    ) -> NexusResult<PromptStream> {
        if !self.is_initialized() {
            return Err(NexusError::NotInitialized);
        }

        let gate = Arc::clone(&self.prompt_gate).lock_owned().await;
        let mut events = Arc::clone(&self.events_rx).lock_owned().await;
        // Drop anything a cancelled predecessor left behind so this
        // prompt's ordering starts clean.
        while events.try_recv().is_ok() {}

        let mut arguments = serde_json::Map::new();
        arguments.insert("prompt".to_string(), Value::String(prompt.to_string()));
        if let Some(Value::Object(extra)) = context {
            arguments.extend(extra);
        }
        let arguments = Value::Object(arguments);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.write_value(&request(
            id,
            method::PROMPTS_REQUEST,
            json!({"name": "default", "arguments": arguments}),
        ))
        .await?;

        Ok(PromptStream {
            prompt_id: id.to_string(),
            events,
            _gate: gate,
            deadline: tokio::time::Instant::now() + self.settings.prompt_timeout(),
            done: false,
        })
    }

    /// Invoke a tool on the peer and wait for its result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> NexusResult<Value> {
        if !self.is_initialized() {
            return Err(NexusError::NotInitialized);
        }
        self.send_request(
            method::TOOLS_CALL,
            json!({"name": name, "arguments": arguments}),
        )
        .await
    }

    /// Close the connection: the reader stops and all pending requests
    /// complete with `PeerClosed`. The subprocess itself is the
    /// supervisor's to stop.
    pub async fn close(&self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
        Self::fail_pending(&self.pending);
        self.initialized.store(false, Ordering::SeqCst);
    }

    async fn send_request(&self, rpc_method: &str, params: Value) -> NexusResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(key.clone(), tx);

        if let Err(err) = self.write_value(&request(id, rpc_method, params)).await {
            self.pending.lock().unwrap().remove(&key);
            return Err(err);
        }

        let timeout = self.settings.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NexusError::PeerClosed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&key);
                Err(NexusError::RequestTimeout(timeout))
            }
        }
    }

    async fn write_value(&self, value: &Value) -> NexusResult<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    fn fail_pending(pending: &PendingMap) {
        let waiters: Vec<oneshot::Sender<NexusResult<Value>>> =
            pending.lock().unwrap().drain().map(|(_, tx)| tx).collect();
        for tx in waiters {
            let _ = tx.send(Err(NexusError::PeerClosed));
        }
    }

    async fn read_loop<R>(
        reader: R,
        writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
        pending: PendingMap,
        tools: Arc<RwLock<HashMap<String, ToolHandler>>>,
        events_tx: UnboundedSender<ReaderEvent>,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "agent stream read failed");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(_) => {
                    // Plain output from the agent: surface it as a log
                    // notification instead of dropping it.
                    let wrapped = notification(
                        method::MESSAGE,
                        json!({"level": "info", "message": trimmed}),
                    );
                    let _ = events_tx.send(ReaderEvent::Peer(wrapped));
                    continue;
                }
            };

            match classify(value.clone()) {
                Some(Incoming::Request { id, method, params }) => {
                    let writer = Arc::clone(&writer);
                    let tools = Arc::clone(&tools);
                    tokio::spawn(async move {
                        Self::handle_request(writer, tools, id, method, params).await;
                    });
                }
                Some(Incoming::Response { id, .. }) => {
                    let waiter = id_key(&id)
                        .and_then(|key| pending.lock().unwrap().remove(&key));
                    match waiter {
                        Some(tx) => {
                            let outcome = Self::response_outcome(&value);
                            let _ = tx.send(outcome);
                        }
                        // No pending entry: this is a prompt completion,
                        // which the active stream matches by id.
                        None => {
                            let _ = events_tx.send(ReaderEvent::Peer(value));
                        }
                    }
                }
                Some(Incoming::Notification { .. }) => {
                    let _ = events_tx.send(ReaderEvent::Peer(value));
                }
                None => {
                    warn!(payload = %trimmed, "unroutable protocol payload");
                }
            }
        }

        Self::fail_pending(&pending);
        let _ = events_tx.send(ReaderEvent::Closed);
        debug!("agent stream closed");
    }

    fn response_outcome(value: &Value) -> NexusResult<Value> {
        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(INTERNAL_ERROR);
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(NexusError::Protocol(format!("peer error {code}: {text}")));
        }
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn handle_request(
        writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
        tools: Arc<RwLock<HashMap<String, ToolHandler>>>,
        id: Value,
        rpc_method: String,
        params: Value,
    ) {
        let reply = match rpc_method.as_str() {
            method::TOOLS_CALL => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                let handler = tools.read().await.get(&name).cloned();
                match handler {
                    Some(handler) => match handler(name.clone(), arguments).await {
                        Ok(result) => response(id, result),
                        Err(err) => {
                            warn!(%err, tool = %name, "tool handler failed");
                            error_response(id, INTERNAL_ERROR, &err.to_string())
                        }
                    },
                    None => error_response(id, METHOD_NOT_FOUND, &format!("Unknown tool: {name}")),
                }
            }
            method::PING => response(id, json!({})),
            other => error_response(id, METHOD_NOT_FOUND, &format!("Method not found: {other}")),
        };

        let mut line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "failed to serialize protocol reply");
                return;
            }
        };
        line.push('\n');
        let mut writer = writer.lock().await;
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            warn!(%err, "failed to write protocol reply");
            return;
        }
        let _ = writer.flush().await;
    }
}

impl Drop for AcpConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

/// Ordered stream of [`PromptEvent`]s for one prompt.
///
/// Ends when the peer signals completion (a response with this prompt's id
/// and a `result`, or a `params.type == "completion"` notification), when
/// the per-prompt deadline elapses, or when the peer closes the stream.
/// Dropping the stream releases the connection for the next prompt.
pub struct PromptStream {
    prompt_id: String,
    events: OwnedMutexGuard<UnboundedReceiver<ReaderEvent>>,
    _gate: OwnedMutexGuard<()>,
    deadline: tokio::time::Instant,
    done: bool,
}

impl PromptStream {
    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<PromptEvent> {
        if self.done {
            return None;
        }
        loop {
            let now = tokio::time::Instant::now();
            if now >= self.deadline {
                self.done = true;
                return Some(PromptEvent::Error {
                    message: "prompt deadline elapsed".to_string(),
                });
            }

            let event = tokio::time::timeout_at(self.deadline, self.events.recv()).await;
            let value = match event {
                Err(_) => {
                    self.done = true;
                    return Some(PromptEvent::Error {
                        message: "prompt deadline elapsed".to_string(),
                    });
                }
                Ok(None) | Ok(Some(ReaderEvent::Closed)) => {
                    self.done = true;
                    return Some(PromptEvent::Error {
                        message: NexusError::PeerClosed.to_string(),
                    });
                }
                Ok(Some(ReaderEvent::Peer(value))) => value,
            };

            let completes = self.is_completion(&value);
            let parsed = PromptEvent::from_peer_message(&value);
            if completes {
                self.done = true;
                return parsed.or(Some(PromptEvent::ToolResult { data: Value::Null }));
            }
            if let Some(event) = parsed {
                return Some(event);
            }
            // Unrecognized peer chatter: skip and keep streaming.
        }
    }

    /// Collect the textual content of `message` events until completion.
    pub async fn collect_text(mut self) -> NexusResult<String> {
        let mut parts = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                PromptEvent::Message { data } => {
                    if let Some(text) = data.get("message").and_then(Value::as_str) {
                        parts.push(text.to_string());
                    }
                }
                PromptEvent::Error { message } => {
                    return Err(NexusError::Protocol(message));
                }
                PromptEvent::ToolCall { .. } | PromptEvent::ToolResult { .. } => {}
            }
        }
        Ok(parts.join("\n"))
    }

    fn is_completion(&self, value: &Value) -> bool {
        if value.get("result").is_some() {
            if let Some(key) = value.get("id").and_then(|id| message::id_key(id)) {
                if key == self.prompt_id {
                    return true;
                }
            }
        }
        value
            .get("params")
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            == Some("completion")
    }
}

/// Register the built-in memory tools on a connection.
///
/// `memory_search` returns the session's most relevant records plus a
/// summary; `memory_store` writes a record through the session's context
/// manager.
pub async fn register_memory_tools(conn: &AcpConnection, context: Arc<ContextManager>) {
    let search_ctx = Arc::clone(&context);
    conn.register_tool(
        "memory_search",
        Arc::new(move |_name: String, args: Value| -> BoxFuture<'static, NexusResult<Value>> {
            let context = Arc::clone(&search_ctx);
            Box::pin(async move {
                let query = args
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;

                let snapshot = context.get_context(&query, limit).await?;
                let memories: Vec<Value> = snapshot
                    .relevant_memories
                    .iter()
                    .map(|m| {
                        json!({
                            "id": m.id,
                            "content": m.content,
                            "source": m.source,
                            "type": m.memory_type.to_string(),
                        })
                    })
                    .collect();
                Ok(json!({"memories": memories, "summary": snapshot.summary}))
            })
        }),
    )
    .await;

    let store_ctx = Arc::clone(&context);
    conn.register_tool(
        "memory_store",
        Arc::new(move |_name: String, args: Value| -> BoxFuture<'static, NexusResult<Value>> {
            let context = Arc::clone(&store_ctx);
            Box::pin(async move {
                let content = args
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let source = args
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or("agent")
                    .to_string();
                let memory_type = args
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(MemoryType::Generic);

                let id = context
                    .store_agent_output(&source, content, memory_type, None)
                    .await?;
                Ok(json!({"id": id, "status": "stored"}))
            })
        }),
    )
    .await;
}
