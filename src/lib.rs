//! MemNexus core: multi-agent orchestration over shared memory.
//!
//! A *session* owns a typed task graph, a shared memory namespace, a set of
//! long-lived agent subprocesses, and a bidirectional JSON-RPC ("ACP")
//! channel to each agent. The engine schedules tasks over the dependency
//! graph, routes prompts to role-matched agents, streams their output into
//! the session's memory, fans memory changes out on a per-session sync
//! topic, and pauses at human intervention gates.
//!
//! ## Components
//!
//! - [`memory`]: record store adapter, per-session context, real-time sync
//! - [`agents`]: agent subprocess supervision
//! - [`protocol`]: the ACP JSON-RPC 2.0 line protocol
//! - [`orchestrator`]: dependency graph, scheduler, intervention gates,
//!   plan execution
//! - [`session`]: the session/agent data model and manager
//!
//! [`Nexus`] wires the components together from a [`config::Settings`]:
//!
//! ```rust,no_run
//! use memnexus::config::Settings;
//! use memnexus::orchestrator::engine::Task;
//! use memnexus::session::{AgentRole, ExecutionStrategy};
//! use memnexus::Nexus;
//!
//! # async fn demo() -> memnexus::error::NexusResult<()> {
//! let nexus = Nexus::new(Settings::default()).await?;
//! let session = nexus.create_session("build", "demo run", ExecutionStrategy::Parallel, ".").await;
//! let session_id = session.read().await.id.clone();
//!
//! let design = Task::new("design", "sketch the API", AgentRole::Architect, "Design it.");
//! let build = Task::new("build", "implement the API", AgentRole::Backend, "Build it.")
//!     .with_dependencies(vec![design.id.clone()]);
//!
//! nexus.engine().create_plan(&session_id, ExecutionStrategy::Parallel, vec![design, build]).await?;
//! let report = nexus.execute_plan(&session_id, None).await?;
//! println!("plan finished: {:?}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod util;

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::agents::supervisor::AgentProcessConfig;
use crate::config::Settings;
use crate::error::{NexusError, NexusResult};
use crate::memory::store::{Embedder, InMemoryVectorIndex, MemoryStore, VectorIndex};
use crate::memory::sync::{MemorySyncBus, RedisBridge};
use crate::metrics::NexusMetrics;
use crate::orchestrator::engine::{
    AcpDispatcher, OrchestratorEngine, PlanReport, ProgressCallback,
};
use crate::orchestrator::intervention::InterventionRegistry;
use crate::protocol::acp::{register_memory_tools, AcpConnection};
use crate::session::{ExecutionStrategy, Session, SessionManager};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a tracing subscriber honouring `RUST_LOG`.
///
/// Intended for binaries and examples embedding the core; libraries should
/// leave subscriber installation to their host.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// The assembled MemNexus core.
///
/// Owns the shared store, the sync bus, the session manager, the
/// intervention registry, the ACP dispatcher and the orchestrator engine,
/// all constructed from one [`Settings`] value.
pub struct Nexus {
    settings: Settings,
    store: Arc<MemoryStore>,
    bus: Arc<MemorySyncBus>,
    sessions: Arc<SessionManager>,
    interventions: Arc<InterventionRegistry>,
    dispatcher: Arc<AcpDispatcher>,
    engine: Arc<OrchestratorEngine>,
    metrics: Arc<NexusMetrics>,
}

impl Nexus {
    /// Assemble a core with the in-memory vector index and no embedder.
    pub async fn new(settings: Settings) -> NexusResult<Self> {
        Self::with_store(settings, Arc::new(InMemoryVectorIndex::new()), None).await
    }

    /// Assemble a core over an external vector index and optional embedder.
    pub async fn with_store(
        settings: Settings,
        index: Arc<dyn VectorIndex>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> NexusResult<Self> {
        if let Err(problems) = settings.validate() {
            return Err(NexusError::InvalidInput(problems.join("; ")));
        }

        let store = Arc::new(MemoryStore::new(index, embedder));

        let mut bus = MemorySyncBus::new(settings.sync.subscriber_queue);
        if let Some(url) = &settings.sync.redis_url {
            match RedisBridge::connect(url).await {
                Ok(bridge) => bus = bus.with_broker(bridge),
                // Local fan-out still works without the broker.
                Err(err) => warn!(%err, "sync broker unavailable, running in-process only"),
            }
        }
        let bus = Arc::new(bus);

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            settings.clone(),
        ));
        let interventions = Arc::new(InterventionRegistry::new(settings.intervention.clone()));
        interventions.start();
        let dispatcher = Arc::new(AcpDispatcher::new());
        let engine = Arc::new(OrchestratorEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&interventions),
            dispatcher.clone(),
            settings.clone(),
        ));
        let metrics = Arc::new(NexusMetrics::new()?);

        Ok(Self {
            settings,
            store,
            bus,
            sessions,
            interventions,
            dispatcher,
            engine,
            metrics,
        })
    }

    /// Settings the core was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shared memory store.
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Session-scoped sync bus.
    pub fn bus(&self) -> &Arc<MemorySyncBus> {
        &self.bus
    }

    /// Session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Intervention registry.
    pub fn interventions(&self) -> &Arc<InterventionRegistry> {
        &self.interventions
    }

    /// Plan execution engine.
    pub fn engine(&self) -> &Arc<OrchestratorEngine> {
        &self.engine
    }

    /// Dispatcher routing prompts onto ACP connections.
    pub fn dispatcher(&self) -> &Arc<AcpDispatcher> {
        &self.dispatcher
    }

    /// Metric set.
    pub fn metrics(&self) -> &Arc<NexusMetrics> {
        &self.metrics
    }

    /// Create a session and count it.
    pub async fn create_session(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        strategy: ExecutionStrategy,
        working_dir: impl Into<String>,
    ) -> Arc<RwLock<Session>> {
        let session = self
            .sessions
            .create(name, description, strategy, working_dir)
            .await;
        self.metrics.active_sessions.inc();
        session
    }

    /// Delete a session and count it.
    pub async fn delete_session(&self, session_id: &str) -> NexusResult<bool> {
        let deleted = self.sessions.delete(session_id).await?;
        if deleted {
            self.metrics.active_sessions.dec();
            self.bus.remove_topic(session_id).await;
        }
        Ok(deleted)
    }

    /// Launch an agent in protocol mode and hand its stdio to a fresh ACP
    /// connection with the memory tools registered.
    ///
    /// The connection is registered with the dispatcher under `agent_id`,
    /// which should match an agent registered in the session so the engine
    /// can route prompts to it.
    pub async fn connect_agent(
        &self,
        session_id: &str,
        agent_id: &str,
        config: AgentProcessConfig,
    ) -> NexusResult<Arc<AcpConnection>> {
        let context = self
            .sessions
            .context(session_id)
            .await
            .ok_or_else(|| NexusError::SessionNotFound(session_id.to_string()))?;

        let pool = self.sessions.pool(session_id).await;
        let process = pool.launch_protocol(config).await?;
        let (stdout, stdin) = process
            .take_io()
            .await
            .ok_or_else(|| NexusError::Protocol("agent stdio already claimed".to_string()))?;

        let conn = Arc::new(AcpConnection::new(
            stdout,
            stdin,
            self.settings.protocol.clone(),
        ));
        register_memory_tools(&conn, context).await;
        conn.initialize().await?;
        self.dispatcher.register(agent_id, Arc::clone(&conn)).await;
        Ok(conn)
    }

    /// Execute the session's plan, counting task transitions.
    pub async fn execute_plan(
        &self,
        session_id: &str,
        on_event: Option<ProgressCallback>,
    ) -> NexusResult<PlanReport> {
        let metrics = Arc::clone(&self.metrics);
        let counted: ProgressCallback = Arc::new(move |event| {
            if let Some(state) = event.data.get("state") {
                if let Ok(state) = serde_json::from_value(state.clone()) {
                    metrics.task_transition(state);
                }
            }
            if let Some(callback) = &on_event {
                callback(event);
            }
        });
        self.engine.execute_plan(session_id, Some(counted)).await
    }
}
