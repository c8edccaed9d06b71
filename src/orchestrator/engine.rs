//! Plan execution.
//!
//! The engine turns a task set into an execution plan, drives it with the
//! chosen strategy, and streams progress events. Task prompts are built
//! from the task itself plus the results of its completed dependencies;
//! agents are selected by role from the owning session; failures retry with
//! a budget and then cascade cancellation through the dependency graph.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{NexusError, NexusResult};
use crate::orchestrator::graph::DependencyGraph;
use crate::orchestrator::intervention::{InterventionRegistry, InterventionStatus};
use crate::protocol::acp::AcpConnection;
use crate::session::{AgentRole, ExecutionStrategy, SessionManager, SessionStatus};
use crate::util::{short_id, truncate_chars};

/// Characters of a dependency's result included in a prompt.
const DEP_RESULT_CHARS: usize = 500;

/// Execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Registered, not yet examined.
    Pending,
    /// Blocked on incomplete dependencies.
    WaitingForDeps,
    /// Dependencies satisfied; eligible to run.
    Ready,
    /// An agent has been selected.
    Assigned,
    /// The agent is working.
    Running,
    /// Output awaiting a reviewer.
    AwaitingReview,
    /// Blocked on a human gate.
    AwaitingHuman,
    /// Finished successfully.
    Completed,
    /// Errored past the retry budget.
    Failed,
    /// Abandoned, usually because a dependency failed.
    Cancelled,
    /// Errored with retries remaining; will requeue.
    Retrying,
}

impl TaskState {
    /// Whether the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// A unit of work routed to one agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque 8-char identifier.
    pub id: String,
    /// Owning session (set when attached to a plan).
    pub session_id: String,
    /// Short name, used in prompts and logs.
    pub name: String,
    /// What the task is about.
    pub description: String,
    /// Role that must execute it.
    pub role: AgentRole,
    /// Prompt template appended after the assembled context.
    pub prompt: String,
    /// Ids of tasks that must complete first.
    pub dependencies: Vec<String>,
    /// Current execution state.
    pub state: TaskState,
    /// Agent currently or last assigned.
    pub assigned_agent: Option<String>,
    /// Result payload once completed.
    pub result: Option<String>,
    /// Failure reason once failed or cancelled.
    pub error: Option<String>,
    /// Retries consumed.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Free-form metadata; also the policy context for human gates.
    pub metadata: HashMap<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First execution start.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal-state time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A pending task with a fresh id and the default retry budget.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        role: AgentRole,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: short_id(),
            session_id: String::new(),
            name: name.into(),
            description: description.into(),
            role,
            prompt: prompt.into(),
            dependencies: Vec::new(),
            state: TaskState::Pending,
            assigned_agent: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the dependency list, consuming and returning the task.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Attach a metadata entry, consuming and returning the task.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A task list with computed phases for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Owning session.
    pub session_id: String,
    /// Strategy the plan executes under.
    pub strategy: ExecutionStrategy,
    /// The tasks, in submission order.
    pub tasks: Vec<Task>,
    /// Task ids grouped into dependency layers.
    pub phases: Vec<Vec<String>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// Task by id.
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Mutable task by id.
    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Ids of tasks currently ready to run.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Ready)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Ids of completed tasks.
    pub fn completed_tasks(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Fraction of tasks in a terminal state.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        let terminal = self.tasks.iter().filter(|t| t.state.is_terminal()).count();
        terminal as f64 / self.tasks.len() as f64
    }

    /// Whether every task is terminal.
    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.state.is_terminal())
    }

    /// The earliest failure, by terminal timestamp.
    pub fn first_failure(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Failed)
            .min_by_key(|t| t.completed_at)
    }
}

/// Final verdict of a plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Every task completed.
    Completed,
    /// At least one task did not complete.
    Failed,
}

/// Outcome of `execute_plan`, with a snapshot of the finished plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    /// Completed iff every task completed.
    pub status: PlanStatus,
    /// First task failure, serialized as the cause.
    pub cause: Option<String>,
    /// The plan as it ended.
    pub plan: ExecutionPlan,
}

/// Progress event emitted on every task state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Always `task_progress`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Owning session.
    pub session_id: String,
    /// Task that changed.
    pub task_id: String,
    /// Transition payload.
    pub data: Value,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

/// Callback receiving progress events.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Sends a prompt to a selected agent and returns its textual result.
///
/// The production implementation drives the agent's protocol adapter; tests
/// substitute scripted dispatchers.
#[async_trait]
pub trait PromptDispatcher: Send + Sync {
    /// Execute `prompt` on the agent and return its collected output.
    async fn dispatch(&self, session_id: &str, agent_id: &str, prompt: &str)
        -> NexusResult<String>;
}

/// Dispatcher backed by per-agent ACP connections.
#[derive(Default)]
pub struct AcpDispatcher {
    connections: RwLock<HashMap<String, Arc<AcpConnection>>>,
}

impl AcpDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the connection serving an agent id.
    pub async fn register(&self, agent_id: impl Into<String>, conn: Arc<AcpConnection>) {
        self.connections.write().await.insert(agent_id.into(), conn);
    }

    /// Drop an agent's connection.
    pub async fn unregister(&self, agent_id: &str) {
        self.connections.write().await.remove(agent_id);
    }
}

#[async_trait]
impl PromptDispatcher for AcpDispatcher {
    async fn dispatch(
        &self,
        _session_id: &str,
        agent_id: &str,
        prompt: &str,
    ) -> NexusResult<String> {
        let conn = self
            .connections
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| {
                NexusError::Protocol(format!("no protocol connection for agent {agent_id}"))
            })?;
        let stream = conn.send_prompt(prompt, None).await?;
        stream.collect_text().await
    }
}

enum DepWait {
    Satisfied,
    DependencyFailed(String),
    TimedOut,
}

enum TaskOutcome {
    Completed,
    Failed,
}

/// Per-session plan execution engine.
pub struct OrchestratorEngine {
    sessions: Arc<SessionManager>,
    interventions: Arc<InterventionRegistry>,
    dispatcher: Arc<dyn PromptDispatcher>,
    settings: Settings,
    plans: RwLock<HashMap<String, Arc<RwLock<ExecutionPlan>>>>,
}

impl OrchestratorEngine {
    /// Wire the engine to its collaborators.
    pub fn new(
        sessions: Arc<SessionManager>,
        interventions: Arc<InterventionRegistry>,
        dispatcher: Arc<dyn PromptDispatcher>,
        settings: Settings,
    ) -> Self {
        Self {
            sessions,
            interventions,
            dispatcher,
            settings,
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Build and store a plan for a session.
    ///
    /// Validates dependency closure and acyclicity, computes phases, and
    /// sets initial task states: dependency-free tasks become ready, the
    /// rest wait.
    pub async fn create_plan(
        &self,
        session_id: &str,
        strategy: ExecutionStrategy,
        mut tasks: Vec<Task>,
    ) -> NexusResult<ExecutionPlan> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| NexusError::SessionNotFound(session_id.to_string()))?;

        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        for task in &tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep) {
                    return Err(NexusError::InvalidInput(format!(
                        "task {} depends on unknown task {dep}",
                        task.id
                    )));
                }
            }
        }

        let mut graph = DependencyGraph::new();
        for task in &tasks {
            graph.add_task(&task.id, &task.dependencies);
        }
        if let Some(path) = graph.detect_cycles() {
            return Err(NexusError::CycleDetected { path });
        }

        for task in &mut tasks {
            task.session_id = session_id.to_string();
            if task.max_retries == 0 {
                task.max_retries = self.settings.orchestrator.max_retries;
            }
            task.state = if task.dependencies.is_empty() {
                TaskState::Ready
            } else {
                TaskState::WaitingForDeps
            };
        }

        let plan = ExecutionPlan {
            session_id: session_id.to_string(),
            strategy,
            phases: graph.phases(),
            tasks: tasks.clone(),
            created_at: Utc::now(),
        };

        {
            let mut session = session.write().await;
            session.tasks = tasks;
            session.updated_at = Utc::now();
        }
        self.plans
            .write()
            .await
            .insert(session_id.to_string(), Arc::new(RwLock::new(plan.clone())));
        info!(session = %session_id, tasks = plan.tasks.len(), phases = plan.phases.len(), "execution plan created");
        Ok(plan)
    }

    /// Stored plan handle for a session.
    pub async fn plan(&self, session_id: &str) -> Option<Arc<RwLock<ExecutionPlan>>> {
        self.plans.read().await.get(session_id).cloned()
    }

    /// Execute the session's plan under its strategy.
    pub async fn execute_plan(
        &self,
        session_id: &str,
        on_event: Option<ProgressCallback>,
    ) -> NexusResult<PlanReport> {
        let plan = self
            .plan(session_id)
            .await
            .ok_or_else(|| NexusError::InvalidInput(format!("no plan for session {session_id}")))?;

        let (strategy, has_deps, task_count) = {
            let plan = plan.read().await;
            (
                plan.strategy,
                plan.tasks.iter().any(|t| !t.dependencies.is_empty()),
                plan.tasks.len(),
            )
        };

        if task_count == 0 {
            return Ok(PlanReport {
                status: PlanStatus::Completed,
                cause: None,
                plan: plan.read().await.clone(),
            });
        }

        self.sessions
            .update_status(session_id, SessionStatus::Running)
            .await;
        // Human gates rely on the deadline monitor.
        self.interventions.start();

        let mut graph = DependencyGraph::new();
        {
            let plan = plan.read().await;
            for task in &plan.tasks {
                graph.add_task(&task.id, &task.dependencies);
            }
        }

        let mut exec = Execution {
            engine: self,
            session_id: session_id.to_string(),
            plan: Arc::clone(&plan),
            graph,
            on_event,
        };

        match strategy {
            ExecutionStrategy::Sequential => exec.run_sequential().await,
            ExecutionStrategy::Parallel => exec.run_parallel().await,
            ExecutionStrategy::Review => exec.run_review().await,
            ExecutionStrategy::Auto => {
                if has_deps {
                    exec.run_parallel().await
                } else {
                    exec.run_sequential().await
                }
            }
        }

        let snapshot = plan.read().await.clone();
        let status = if snapshot
            .tasks
            .iter()
            .all(|t| t.state == TaskState::Completed)
        {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        };
        let cause = snapshot.first_failure().map(|task| {
            format!(
                "task {} failed: {}",
                task.id,
                task.error.as_deref().unwrap_or("unknown error")
            )
        });

        self.sessions
            .update_status(
                session_id,
                match status {
                    PlanStatus::Completed => SessionStatus::Completed,
                    PlanStatus::Failed => SessionStatus::Error,
                },
            )
            .await;

        {
            // Mirror final task states back onto the session.
            if let Some(handle) = self.sessions.get(session_id).await {
                let mut session = handle.write().await;
                session.tasks = snapshot.tasks.clone();
                session.updated_at = Utc::now();
            }
        }

        info!(session = %session_id, ?status, "plan execution finished");
        Ok(PlanReport {
            status,
            cause,
            plan: snapshot,
        })
    }

    /// Cancel a session's plan: every non-terminal task becomes cancelled.
    pub async fn cancel_plan(&self, session_id: &str) {
        let Some(plan) = self.plan(session_id).await else {
            return;
        };
        let mut plan = plan.write().await;
        for task in plan.tasks.iter_mut() {
            if !task.state.is_terminal() {
                task.state = TaskState::Cancelled;
                task.error = Some("plan cancelled".to_string());
                task.completed_at = Some(Utc::now());
            }
        }
        warn!(session = %session_id, "plan cancelled");
    }
}

/// One plan run in flight.
struct Execution<'a> {
    engine: &'a OrchestratorEngine,
    session_id: String,
    plan: Arc<RwLock<ExecutionPlan>>,
    graph: DependencyGraph,
    on_event: Option<ProgressCallback>,
}

impl Execution<'_> {
    fn emit(&self, task_id: &str, data: Value) {
        let event = ProgressEvent {
            event_type: "task_progress".to_string(),
            session_id: self.session_id.clone(),
            task_id: task_id.to_string(),
            data,
            timestamp: Utc::now(),
        };
        debug!(task = %task_id, data = %event.data, "task progress");
        if let Some(callback) = &self.on_event {
            callback(event);
        }
    }

    async fn set_state(&self, task_id: &str, state: TaskState) {
        {
            let mut plan = self.plan.write().await;
            if let Some(task) = plan.task_mut(task_id) {
                task.state = state;
            }
        }
        self.emit(task_id, json!({"state": state}));
    }

    async fn store_final_record(&self, task_id: &str) {
        let (name, payload, success, agent) = {
            let plan = self.plan.read().await;
            let Some(task) = plan.task(task_id) else {
                return;
            };
            let success = task.state == TaskState::Completed;
            let payload = if success {
                task.result.clone().unwrap_or_default()
            } else {
                task.error.clone().unwrap_or_default()
            };
            let agent = task
                .assigned_agent
                .clone()
                .unwrap_or_else(|| "system".to_string());
            (task.name.clone(), payload, success, agent)
        };

        if let Some(context) = self.engine.sessions.context(&self.session_id).await {
            if let Err(err) = context
                .store_task_result(&agent, &name, &payload, success)
                .await
            {
                warn!(%err, task = %task_id, "failed to store task result record");
            }
        }
    }

    async fn complete_task(&self, task_id: &str, result: String) {
        {
            let mut plan = self.plan.write().await;
            if let Some(task) = plan.task_mut(task_id) {
                task.state = TaskState::Completed;
                task.result = Some(result.clone());
                task.error = None;
                task.completed_at = Some(Utc::now());
            }
        }
        self.emit(
            task_id,
            json!({
                "state": TaskState::Completed,
                "result": truncate_chars(&result, DEP_RESULT_CHARS),
            }),
        );
        self.store_final_record(task_id).await;
        self.promote_dependents(task_id).await;
    }

    async fn fail_task(&self, task_id: &str, reason: String) {
        {
            let mut plan = self.plan.write().await;
            if let Some(task) = plan.task_mut(task_id) {
                task.state = TaskState::Failed;
                task.error = Some(reason.clone());
                task.completed_at = Some(Utc::now());
            }
        }
        warn!(task = %task_id, %reason, "task failed");
        self.emit(task_id, json!({"state": TaskState::Failed, "error": reason}));
        self.store_final_record(task_id).await;
    }

    /// Cancel every task that transitively depends on `failed_id`.
    async fn cascade_cancel(&self, failed_id: &str) {
        let mut descendants: Vec<String> = self
            .graph
            .transitive_dependents(failed_id)
            .into_iter()
            .collect();
        descendants.sort();

        for dependent in descendants {
            let cancelled = {
                let mut plan = self.plan.write().await;
                match plan.task_mut(&dependent) {
                    Some(task) if !task.state.is_terminal() => {
                        task.state = TaskState::Cancelled;
                        task.error = Some(format!("dependency failed: {failed_id}"));
                        task.completed_at = Some(Utc::now());
                        true
                    }
                    _ => false,
                }
            };
            if cancelled {
                self.emit(
                    &dependent,
                    json!({
                        "state": TaskState::Cancelled,
                        "error": format!("dependency failed: {failed_id}"),
                    }),
                );
                self.store_final_record(&dependent).await;
            }
        }
    }

    /// Promote waiting dependents whose dependencies are now all complete.
    async fn promote_dependents(&self, completed_id: &str) {
        let mut promoted = Vec::new();
        {
            let mut plan = self.plan.write().await;
            for dependent in self.graph.dependents(completed_id) {
                let all_done = {
                    let Some(task) = plan.task(&dependent) else {
                        continue;
                    };
                    task.state == TaskState::WaitingForDeps
                        && task.dependencies.iter().all(|dep| {
                            plan.task(dep)
                                .map(|d| d.state == TaskState::Completed)
                                .unwrap_or(false)
                        })
                };
                if all_done {
                    if let Some(task) = plan.task_mut(&dependent) {
                        task.state = TaskState::Ready;
                        promoted.push(dependent.clone());
                    }
                }
            }
        }
        for task_id in promoted {
            self.emit(&task_id, json!({"state": TaskState::Ready}));
        }
    }

    async fn wait_for_dependencies(&self, task_id: &str) -> DepWait {
        let deps = {
            let plan = self.plan.read().await;
            match plan.task(task_id) {
                Some(task) => task.dependencies.clone(),
                None => return DepWait::Satisfied,
            }
        };
        if deps.is_empty() {
            return DepWait::Satisfied;
        }

        let poll = self.engine.settings.orchestrator.dependency_poll();
        let deadline = tokio::time::Instant::now() + self.engine.settings.orchestrator.dependency_wait();

        loop {
            let mut all_complete = true;
            {
                let plan = self.plan.read().await;
                for dep in &deps {
                    match plan.task(dep).map(|d| d.state) {
                        Some(TaskState::Completed) => {}
                        Some(TaskState::Failed) | Some(TaskState::Cancelled) => {
                            return DepWait::DependencyFailed(dep.clone());
                        }
                        _ => {
                            all_complete = false;
                        }
                    }
                }
            }
            if all_complete {
                return DepWait::Satisfied;
            }
            if tokio::time::Instant::now() >= deadline {
                return DepWait::TimedOut;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Select an idle agent of the role, warning and giving up once the
    /// starvation threshold passes.
    async fn acquire_agent(&self, task_id: &str, role: AgentRole) -> NexusResult<String> {
        let poll = self.engine.settings.orchestrator.dependency_poll();
        let threshold = self.engine.settings.orchestrator.starvation_timeout();
        let started = tokio::time::Instant::now();

        loop {
            if let Some(agent_id) = self
                .engine
                .sessions
                .acquire_idle_agent(&self.session_id, role, task_id)
                .await
            {
                return Ok(agent_id);
            }
            if started.elapsed() >= threshold {
                warn!(
                    task = %task_id,
                    %role,
                    waited = ?started.elapsed(),
                    "no idle agent for role, task starved"
                );
                return Err(NexusError::AgentUnavailable(role));
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn build_prompt(plan: &ExecutionPlan, task: &Task) -> String {
        let mut parts = vec![format!("# Task: {}\n", task.name)];
        if !task.description.is_empty() {
            parts.push(format!("## Description\n{}\n", task.description));
        }

        let mut dep_sections = Vec::new();
        for dep_id in &task.dependencies {
            if let Some(dep) = plan.task(dep_id) {
                if dep.state == TaskState::Completed {
                    if let Some(result) = &dep.result {
                        dep_sections.push(format!(
                            "### {}\n{}\n",
                            dep.name,
                            truncate_chars(result, DEP_RESULT_CHARS)
                        ));
                    }
                }
            }
        }
        if !dep_sections.is_empty() {
            parts.push("## Context from Previous Tasks\n".to_string());
            parts.extend(dep_sections);
        }

        parts.push(format!("## Instructions\n{}\n", task.prompt));
        parts.join("\n")
    }

    /// Gate the task on human approval when an installed policy matches its
    /// context. Expired approvals are treated as rejections.
    async fn approval_gate(&self, task_id: &str) -> NexusResult<()> {
        let (name, context) = {
            let plan = self.plan.read().await;
            let Some(task) = plan.task(task_id) else {
                return Ok(());
            };
            let mut context = task.metadata.clone();
            context.insert("task_name".to_string(), json!(task.name));
            context.insert("role".to_string(), json!(task.role.to_string()));
            (task.name.clone(), context)
        };

        if !self.engine.interventions.requires_intervention(&context).await {
            return Ok(());
        }

        self.set_state(task_id, TaskState::AwaitingHuman).await;
        let deadline = Duration::from_secs(
            self.engine.settings.intervention.approval_deadline_secs,
        );
        let point = self
            .engine
            .interventions
            .request_approval(
                &self.session_id,
                task_id,
                format!("Approve task: {name}"),
                "A policy matched this task's context; approval is required before it runs.",
                context,
                Some(deadline),
            )
            .await;

        let resolved = self
            .engine
            .interventions
            .wait_for_resolution(&point.id, None)
            .await?;

        match resolved.status {
            InterventionStatus::Approved | InterventionStatus::Modified => Ok(()),
            InterventionStatus::Expired => {
                Err(NexusError::InterventionExpired(point.id.clone()))
            }
            _ => Err(NexusError::TaskFailed {
                id: task_id.to_string(),
                reason: "approval rejected".to_string(),
            }),
        }
    }

    /// Run one task to a terminal state, including retries.
    async fn run_single_task(&self, task_id: &str, cascade_on_failure: bool) -> TaskOutcome {
        loop {
            let (role, max_retries) = {
                let plan = self.plan.read().await;
                match plan.task(task_id) {
                    Some(task) => (task.role, task.max_retries),
                    None => return TaskOutcome::Failed,
                }
            };

            let agent_id = match self.acquire_agent(task_id, role).await {
                Ok(agent_id) => agent_id,
                Err(err) => {
                    self.fail_task(task_id, err.to_string()).await;
                    if cascade_on_failure {
                        self.cascade_cancel(task_id).await;
                    }
                    return TaskOutcome::Failed;
                }
            };

            {
                let mut plan = self.plan.write().await;
                if let Some(task) = plan.task_mut(task_id) {
                    task.assigned_agent = Some(agent_id.clone());
                }
            }
            self.set_state(task_id, TaskState::Assigned).await;

            if let Err(err) = self.approval_gate(task_id).await {
                self.engine
                    .sessions
                    .release_agent(&self.session_id, &agent_id, true)
                    .await;
                self.fail_task(task_id, err.to_string()).await;
                if cascade_on_failure {
                    self.cascade_cancel(task_id).await;
                }
                return TaskOutcome::Failed;
            }

            let prompt = {
                let mut plan = self.plan.write().await;
                if let Some(task) = plan.task_mut(task_id) {
                    task.state = TaskState::Running;
                    task.started_at.get_or_insert_with(Utc::now);
                }
                let plan = &*plan;
                match plan.task(task_id) {
                    Some(task) => Self::build_prompt(plan, task),
                    None => return TaskOutcome::Failed,
                }
            };
            self.emit(task_id, json!({"state": TaskState::Running}));

            match self
                .engine
                .dispatcher
                .dispatch(&self.session_id, &agent_id, &prompt)
                .await
            {
                Ok(result) => {
                    self.engine
                        .sessions
                        .release_agent(&self.session_id, &agent_id, true)
                        .await;
                    self.complete_task(task_id, result).await;
                    return TaskOutcome::Completed;
                }
                Err(err) => {
                    // Only process-level faults sideline the agent; task
                    // errors return it to the idle pool for the retry.
                    let agent_ok = !matches!(
                        err,
                        NexusError::PeerClosed | NexusError::SendFailed(_)
                    );
                    self.engine
                        .sessions
                        .release_agent(&self.session_id, &agent_id, agent_ok)
                        .await;

                    let retries = {
                        let mut plan = self.plan.write().await;
                        match plan.task_mut(task_id) {
                            Some(task) => {
                                task.retry_count += 1;
                                task.error = Some(err.to_string());
                                task.retry_count
                            }
                            None => return TaskOutcome::Failed,
                        }
                    };

                    if retries < max_retries {
                        debug!(task = %task_id, retries, "task errored, requeueing");
                        self.set_state(task_id, TaskState::Retrying).await;
                        self.set_state(task_id, TaskState::Ready).await;
                        continue;
                    }

                    self.fail_task(task_id, err.to_string()).await;
                    if cascade_on_failure {
                        self.cascade_cancel(task_id).await;
                    }
                    return TaskOutcome::Failed;
                }
            }
        }
    }

    /// Mark everything not yet terminal as cancelled after an abort.
    async fn cancel_remaining(&self, reason: &str) {
        let cancelled: Vec<String> = {
            let mut plan = self.plan.write().await;
            let mut ids = Vec::new();
            for task in plan.tasks.iter_mut() {
                if !task.state.is_terminal() {
                    task.state = TaskState::Cancelled;
                    task.error = Some(reason.to_string());
                    task.completed_at = Some(Utc::now());
                    ids.push(task.id.clone());
                }
            }
            ids
        };
        for task_id in cancelled {
            self.emit(
                &task_id,
                json!({"state": TaskState::Cancelled, "error": reason}),
            );
        }
    }

    async fn run_sequential(&mut self) {
        let order: Vec<String> = {
            let plan = self.plan.read().await;
            plan.tasks.iter().map(|t| t.id.clone()).collect()
        };

        for task_id in order {
            if self.plan.read().await.task(&task_id).map(|t| t.state.is_terminal()) == Some(true) {
                continue;
            }

            match self.wait_for_dependencies(&task_id).await {
                DepWait::Satisfied => {}
                DepWait::DependencyFailed(dep) => {
                    let reason = format!("dependency failed: {dep}");
                    {
                        let mut plan = self.plan.write().await;
                        if let Some(task) = plan.task_mut(&task_id) {
                            task.state = TaskState::Cancelled;
                            task.error = Some(reason.clone());
                            task.completed_at = Some(Utc::now());
                        }
                    }
                    self.emit(&task_id, json!({"state": TaskState::Cancelled, "error": reason}));
                    self.cancel_remaining("plan aborted").await;
                    return;
                }
                DepWait::TimedOut => {
                    self.fail_task(&task_id, "timeout waiting for dependencies".to_string())
                        .await;
                    self.cancel_remaining("plan aborted").await;
                    return;
                }
            }

            if matches!(self.run_single_task(&task_id, false).await, TaskOutcome::Failed) {
                // Sequential aborts the whole plan on the first hard failure.
                self.cancel_remaining("plan aborted").await;
                return;
            }
        }
    }

    async fn run_parallel(&mut self) {
        let poll = self.engine.settings.orchestrator.dependency_poll();
        let max_idle_rounds = (self
            .engine
            .settings
            .orchestrator
            .dependency_wait()
            .as_millis()
            / poll.as_millis().max(1))
        .max(1) as u32;
        let mut idle_rounds = 0u32;

        loop {
            let (ready, all_terminal) = {
                let plan = self.plan.read().await;
                (plan.ready_tasks(), plan.all_terminal())
            };
            if all_terminal {
                break;
            }
            if ready.is_empty() {
                idle_rounds += 1;
                if idle_rounds > max_idle_rounds {
                    self.cancel_remaining("timeout waiting for dependencies").await;
                    break;
                }
                tokio::time::sleep(poll).await;
                continue;
            }
            idle_rounds = 0;

            let batch: Vec<_> = ready
                .iter()
                .map(|task_id| self.run_single_task(task_id, true))
                .collect();
            join_all(batch).await;
        }
    }

    async fn run_review(&mut self) {
        self.run_sequential().await;

        let completed: Vec<(String, String, String)> = {
            let plan = self.plan.read().await;
            plan.tasks
                .iter()
                .filter(|t| t.state == TaskState::Completed)
                .map(|t| {
                    (
                        t.id.clone(),
                        t.name.clone(),
                        t.result.clone().unwrap_or_default(),
                    )
                })
                .collect()
        };
        if completed.is_empty() {
            return;
        }

        let mut review_ids = Vec::new();
        {
            let mut plan = self.plan.write().await;
            for (task_id, name, result) in &completed {
                let review_id = format!("review_{task_id}");
                let mut review = Task::new(
                    format!("Review: {name}"),
                    format!("Review the output of task {name}"),
                    AgentRole::Reviewer,
                    format!("Review the following work:\n{result}"),
                );
                review.id = review_id.clone();
                review.session_id = self.session_id.clone();
                review.state = TaskState::Ready;
                plan.tasks.push(review);
                review_ids.push(review_id);
            }
        }
        for review_id in &review_ids {
            self.graph.add_task(review_id, &[]);
            self.emit(review_id, json!({"state": TaskState::Ready}));
        }

        for review_id in review_ids {
            // Reviews mark their original as reviewed once done.
            let original = review_id.trim_start_matches("review_").to_string();
            self.set_state(&original, TaskState::AwaitingReview).await;
            let outcome = self.run_single_task(&review_id, false).await;
            self.set_state(&original, TaskState::Completed).await;
            if matches!(outcome, TaskOutcome::Failed) {
                debug!(review = %review_id, "review task failed");
            }
        }
    }
}
