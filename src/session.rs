//! Sessions: the bounded multi-agent workspaces everything else hangs off.
//!
//! A session owns its agents and tasks by value; runtime handles (context
//! managers, supervisor pools, bus subscriptions) live in the manager's
//! per-session maps so the data model stays serializable. The manager is
//! the single writer of the session registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::agents::supervisor::{AgentPool, AgentProcessConfig};
use crate::config::Settings;
use crate::error::{NexusError, NexusResult};
use crate::memory::context::{ContextManager, ContextSnapshot};
use crate::memory::store::{MemoryStore, MemoryType};
use crate::memory::sync::{MemorySyncBus, Subscription};
use crate::orchestrator::engine::Task;
use crate::util::short_id;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but not yet executing.
    Created,
    /// A plan is executing.
    Running,
    /// Execution suspended.
    Paused,
    /// All work finished.
    Completed,
    /// Execution aborted on error.
    Error,
}

/// Task-routing label for agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// System design and planning.
    Architect,
    /// Server-side implementation.
    Backend,
    /// Client-side implementation.
    Frontend,
    /// Test authoring and execution.
    Tester,
    /// Code and output review.
    Reviewer,
    /// Infrastructure and deployment.
    Devops,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentRole::Architect => "architect",
            AgentRole::Backend => "backend",
            AgentRole::Frontend => "frontend",
            AgentRole::Tester => "tester",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Devops => "devops",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for AgentRole {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "architect" => Ok(AgentRole::Architect),
            "backend" => Ok(AgentRole::Backend),
            "frontend" => Ok(AgentRole::Frontend),
            "tester" => Ok(AgentRole::Tester),
            "reviewer" => Ok(AgentRole::Reviewer),
            "devops" => Ok(AgentRole::Devops),
            other => Err(NexusError::InvalidInput(format!("unknown role: {other}"))),
        }
    }
}

impl AgentRole {
    /// The busy status an agent of this role enters while working.
    pub fn busy_status(&self) -> AgentStatus {
        match self {
            AgentRole::Architect => AgentStatus::Planning,
            AgentRole::Reviewer => AgentStatus::Reviewing,
            _ => AgentStatus::Coding,
        }
    }
}

/// Operational status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Available for work.
    Idle,
    /// Working on a planning task.
    Planning,
    /// Working on an implementation task.
    Coding,
    /// Working on a review task.
    Reviewing,
    /// Blocked on an external response.
    Waiting,
    /// Subprocess faulted; recoverable by respawn.
    Error,
    /// Subprocess gone.
    Offline,
}

/// How a plan's tasks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One task at a time in dependency order.
    Sequential,
    /// Ready tasks run concurrently.
    Parallel,
    /// Sequential pass followed by reviewer tasks.
    Review,
    /// Pick based on the task graph and available agents.
    Auto,
}

/// Launch configuration for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Role this agent serves.
    pub role: AgentRole,
    /// Command-line template (e.g. `claude --acp`).
    pub cli: String,
    /// Working directory; defaults to the session's.
    pub working_dir: String,
    /// Environment overlay.
    pub env: HashMap<String, String>,
    /// Per-task timeout in seconds.
    pub timeout_secs: u64,
}

impl AgentConfig {
    /// Config for a role and CLI with defaults for the rest.
    pub fn new(role: AgentRole, cli: impl Into<String>) -> Self {
        Self {
            role,
            cli: cli.into(),
            working_dir: ".".to_string(),
            env: HashMap::new(),
            timeout_secs: 300,
        }
    }
}

/// An agent registered in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Opaque 8-char identifier.
    pub id: String,
    /// Owning session (weak back-reference by id).
    pub session_id: String,
    /// Display name; also the output prefix.
    pub name: String,
    /// Launch configuration.
    pub config: AgentConfig,
    /// Operational status.
    pub status: AgentStatus,
    /// Task currently assigned, if any.
    pub current_task: Option<String>,
    /// Subprocess pid when running.
    pub pid: Option<u32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Register a new idle agent.
    pub fn new(session_id: impl Into<String>, name: impl Into<String>, config: AgentConfig) -> Self {
        let now = Utc::now();
        Self {
            id: short_id(),
            session_id: session_id.into(),
            name: name.into(),
            config,
            status: AgentStatus::Idle,
            current_task: None,
            pid: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A bounded multi-agent workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque 8-char identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Default execution strategy.
    pub strategy: ExecutionStrategy,
    /// Working directory agents inherit by default.
    pub working_dir: String,
    /// Agents owned by this session.
    pub agents: Vec<Agent>,
    /// Tasks owned by this session.
    pub tasks: Vec<Task>,
    /// Free-form metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        strategy: ExecutionStrategy,
        working_dir: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: short_id(),
            name: name.into(),
            description: description.into(),
            status: SessionStatus::Created,
            strategy,
            working_dir: working_dir.into(),
            agents: Vec::new(),
            tasks: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Descriptor returned from a successful agent launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLaunch {
    /// Agent name.
    pub name: String,
    /// CLI that was launched.
    pub cli: String,
    /// Reported status.
    pub status: String,
    /// Subprocess pid.
    pub pid: Option<u32>,
}

/// Owner of every session and its runtime resources.
pub struct SessionManager {
    store: Arc<MemoryStore>,
    bus: Arc<MemorySyncBus>,
    settings: Settings,
    sessions: RwLock<HashMap<String, Arc<RwLock<Session>>>>,
    contexts: RwLock<HashMap<String, Arc<ContextManager>>>,
    pools: RwLock<HashMap<String, Arc<AgentPool>>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl SessionManager {
    /// Manager over a shared store and bus.
    pub fn new(store: Arc<MemoryStore>, bus: Arc<MemorySyncBus>, settings: Settings) -> Self {
        Self {
            store,
            bus,
            settings,
            sessions: RwLock::new(HashMap::new()),
            contexts: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session and wire up its context manager.
    pub async fn create(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        strategy: ExecutionStrategy,
        working_dir: impl Into<String>,
    ) -> Arc<RwLock<Session>> {
        let session = Session::new(name, description, strategy, working_dir);
        let session_id = session.id.clone();

        let context = Arc::new(ContextManager::new(
            session_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
        ));
        self.contexts
            .write()
            .await
            .insert(session_id.clone(), context);

        // Mirror the session's memory traffic into the log stream.
        let topic = session_id.clone();
        let subscription = self
            .bus
            .subscribe(
                &session_id,
                Arc::new(move |event: crate::memory::sync::SyncEvent| {
                    trace!(session = %topic, source = %event.source, "memory event");
                }),
            )
            .await;
        self.subscriptions
            .write()
            .await
            .insert(session_id.clone(), subscription);

        let handle = Arc::new(RwLock::new(session));
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::clone(&handle));
        info!(session = %session_id, "session created");
        handle
    }

    /// Look up a session by id.
    pub async fn get(&self, session_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Snapshot every session.
    pub async fn list_all(&self) -> Vec<Session> {
        let handles: Vec<Arc<RwLock<Session>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            sessions.push(handle.read().await.clone());
        }
        sessions
    }

    /// Update a session's lifecycle status.
    pub async fn update_status(&self, session_id: &str, status: SessionStatus) -> bool {
        let Some(handle) = self.get(session_id).await else {
            return false;
        };
        let mut session = handle.write().await;
        session.status = status;
        session.updated_at = Utc::now();
        true
    }

    /// Delete a session: stop its agents, drop its runtime handles, and
    /// forget it. Memory records are retained for history.
    pub async fn delete(&self, session_id: &str) -> NexusResult<bool> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_none() {
            return Ok(false);
        }

        if let Some(pool) = self.pools.write().await.remove(session_id) {
            pool.stop_all().await?;
        }
        self.subscriptions.write().await.remove(session_id);
        self.contexts.write().await.remove(session_id);
        info!(session = %session_id, "session deleted");
        Ok(true)
    }

    /// Register an agent with a session.
    pub async fn add_agent(
        &self,
        session_id: &str,
        name: impl Into<String>,
        config: AgentConfig,
    ) -> NexusResult<Agent> {
        let handle = self
            .get(session_id)
            .await
            .ok_or_else(|| NexusError::SessionNotFound(session_id.to_string()))?;
        let agent = Agent::new(session_id, name, config);
        let mut session = handle.write().await;
        session.agents.push(agent.clone());
        session.updated_at = Utc::now();
        Ok(agent)
    }

    /// Attach a task to a session.
    pub async fn add_task(&self, session_id: &str, mut task: Task) -> NexusResult<Task> {
        let handle = self
            .get(session_id)
            .await
            .ok_or_else(|| NexusError::SessionNotFound(session_id.to_string()))?;
        task.session_id = session_id.to_string();
        let mut session = handle.write().await;
        session.tasks.push(task.clone());
        session.updated_at = Utc::now();
        Ok(task)
    }

    /// Context manager for a session.
    pub async fn context(&self, session_id: &str) -> Option<Arc<ContextManager>> {
        self.contexts.read().await.get(session_id).cloned()
    }

    /// Search a session's memory.
    pub async fn search_context(
        &self,
        session_id: &str,
        query: &str,
        limit: usize,
    ) -> NexusResult<ContextSnapshot> {
        let context = self
            .context(session_id)
            .await
            .ok_or_else(|| NexusError::SessionNotFound(session_id.to_string()))?;
        context.get_context(query, limit).await
    }

    /// Launch an agent subprocess in wrapper mode.
    ///
    /// The child's output lines are written into the session's memory as
    /// conversation records through the context manager.
    pub async fn launch_agent(
        &self,
        session_id: &str,
        cli: &str,
        name: &str,
        working_dir: Option<&str>,
    ) -> NexusResult<AgentLaunch> {
        let handle = self
            .get(session_id)
            .await
            .ok_or_else(|| NexusError::SessionNotFound(session_id.to_string()))?;
        let context = self
            .context(session_id)
            .await
            .ok_or_else(|| NexusError::SessionNotFound(session_id.to_string()))?;

        let session_dir = handle.read().await.working_dir.clone();
        let work_dir = working_dir.unwrap_or(&session_dir).to_string();

        let pool = self.pool(session_id).await;
        let agent_name = name.to_string();
        let callback: crate::agents::supervisor::OutputCallback = {
            let context = Arc::clone(&context);
            let agent_name = agent_name.clone();
            Arc::new(move |line: String| {
                let context = Arc::clone(&context);
                let agent_name = agent_name.clone();
                tokio::spawn(async move {
                    if let Err(err) = context
                        .store_agent_output(&agent_name, line, MemoryType::Conversation, None)
                        .await
                    {
                        warn!(%err, agent = %agent_name, "failed to record agent output");
                    }
                });
            })
        };

        let mut config = AgentProcessConfig::new(name, cli);
        config.working_dir = work_dir;
        let process = pool.launch(config, Some(callback)).await?;
        debug!(session = %session_id, agent = %name, pid = ?process.pid(), "agent launched");

        Ok(AgentLaunch {
            name: name.to_string(),
            cli: cli.to_string(),
            status: "running".to_string(),
            pid: process.pid(),
        })
    }

    /// The session's supervisor pool, created on first use.
    pub async fn pool(&self, session_id: &str) -> Arc<AgentPool> {
        if let Some(pool) = self.pools.read().await.get(session_id) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write().await;
        Arc::clone(pools.entry(session_id.to_string()).or_insert_with(|| {
            Arc::new(AgentPool::new(session_id, self.settings.agent.stop_grace()))
        }))
    }

    /// Claim an idle agent of `role`, marking it busy on `task_id`.
    pub async fn acquire_idle_agent(
        &self,
        session_id: &str,
        role: AgentRole,
        task_id: &str,
    ) -> Option<String> {
        let handle = self.get(session_id).await?;
        let mut session = handle.write().await;
        let agent = session
            .agents
            .iter_mut()
            .find(|a| a.config.role == role && a.status == AgentStatus::Idle)?;
        agent.status = role.busy_status();
        agent.current_task = Some(task_id.to_string());
        agent.updated_at = Utc::now();
        Some(agent.id.clone())
    }

    /// Return an agent to the idle pool, or flag it errored.
    pub async fn release_agent(&self, session_id: &str, agent_id: &str, success: bool) {
        let Some(handle) = self.get(session_id).await else {
            return;
        };
        let mut session = handle.write().await;
        if let Some(agent) = session.agents.iter_mut().find(|a| a.id == agent_id) {
            agent.status = if success {
                AgentStatus::Idle
            } else {
                AgentStatus::Error
            };
            agent.current_task = None;
            agent.updated_at = Utc::now();
        }
    }
}
