//! End-to-end plan execution scenarios over a scripted dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use memnexus::config::Settings;
use memnexus::error::{NexusError, NexusResult};
use memnexus::memory::store::{MemoryStore, MemoryType};
use memnexus::memory::sync::MemorySyncBus;
use memnexus::orchestrator::engine::{
    OrchestratorEngine, PlanStatus, ProgressEvent, PromptDispatcher, Task, TaskState,
};
use memnexus::orchestrator::intervention::{InterventionRegistry, InterventionStatus};
use memnexus::session::{AgentConfig, AgentRole, ExecutionStrategy, SessionManager};

/// Dispatcher that answers prompts from a script keyed by task name.
///
/// The task name is recovered from the prompt's `# Task: <name>` header,
/// which also exercises the engine's prompt assembly.
struct ScriptedDispatcher {
    results: HashMap<String, String>,
    failures: Vec<String>,
    delay: Duration,
    prompts: Mutex<HashMap<String, String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedDispatcher {
    fn new() -> Self {
        Self {
            results: HashMap::new(),
            failures: Vec::new(),
            delay: Duration::ZERO,
            prompts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_result(mut self, task: &str, result: impl Into<String>) -> Self {
        self.results.insert(task.to_string(), result.into());
        self
    }

    fn failing(mut self, task: &str) -> Self {
        self.failures.push(task.to_string());
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn prompt_for(&self, task: &str) -> Option<String> {
        self.prompts.lock().unwrap().get(task).cloned()
    }

    fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PromptDispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        _session_id: &str,
        _agent_id: &str,
        prompt: &str,
    ) -> NexusResult<String> {
        let name = prompt
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("# Task: "))
            .unwrap_or_default()
            .to_string();
        self.prompts
            .lock()
            .unwrap()
            .insert(name.clone(), prompt.to_string());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failures.contains(&name) {
            return Err(NexusError::Protocol(format!("agent crashed on {name}")));
        }
        Ok(self
            .results
            .get(&name)
            .cloned()
            .unwrap_or_else(|| format!("result-{name}")))
    }
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.orchestrator.dependency_poll_ms = 10;
    settings.orchestrator.dependency_wait_secs = 5;
    settings.orchestrator.starvation_timeout_secs = 2;
    settings.intervention.monitor_interval_ms = 20;
    settings
}

struct Fixture {
    store: Arc<MemoryStore>,
    sessions: Arc<SessionManager>,
    interventions: Arc<InterventionRegistry>,
    engine: Arc<OrchestratorEngine>,
    session_id: String,
}

async fn fixture(settings: Settings, dispatcher: Arc<ScriptedDispatcher>) -> Fixture {
    let store = Arc::new(MemoryStore::in_memory());
    let bus = Arc::new(MemorySyncBus::new(64));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        bus,
        settings.clone(),
    ));
    let interventions = Arc::new(InterventionRegistry::new(settings.intervention.clone()));
    let engine = Arc::new(OrchestratorEngine::new(
        Arc::clone(&sessions),
        Arc::clone(&interventions),
        dispatcher,
        settings,
    ));
    let handle = sessions
        .create("scenario", "", ExecutionStrategy::Sequential, ".")
        .await;
    let session_id = handle.read().await.id.clone();
    Fixture {
        store,
        sessions,
        interventions,
        engine,
        session_id,
    }
}

fn named_task(id: &str, role: AgentRole, deps: &[&str]) -> Task {
    let mut task = Task::new(id, format!("{id} description"), role, format!("Do {id}."));
    task.id = id.to_string();
    task.dependencies = deps.iter().map(|d| d.to_string()).collect();
    task
}

async fn add_agent(fixture: &Fixture, name: &str, role: AgentRole) {
    fixture
        .sessions
        .add_agent(&fixture.session_id, name, AgentConfig::new(role, "cat"))
        .await
        .unwrap();
}

#[tokio::test]
async fn linear_chain_runs_sequentially_with_dependency_context() {
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .with_result("a", "result-a")
            .with_result("b", "B".repeat(600)),
    );
    let fx = fixture(fast_settings(), Arc::clone(&dispatcher)).await;
    add_agent(&fx, "arch", AgentRole::Architect).await;
    add_agent(&fx, "be", AgentRole::Backend).await;
    add_agent(&fx, "qa", AgentRole::Tester).await;

    let tasks = vec![
        named_task("a", AgentRole::Architect, &[]),
        named_task("b", AgentRole::Backend, &["a"]),
        named_task("c", AgentRole::Tester, &["b"]),
    ];
    let plan = fx
        .engine
        .create_plan(&fx.session_id, ExecutionStrategy::Sequential, tasks)
        .await
        .unwrap();
    assert_eq!(
        plan.phases,
        vec![
            vec!["a".to_string()],
            vec!["b".to_string()],
            vec!["c".to_string()],
        ]
    );

    let report = fx.engine.execute_plan(&fx.session_id, None).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert!(report
        .plan
        .tasks
        .iter()
        .all(|t| t.state == TaskState::Completed));

    // C sees the first 500 chars of B's result, and nothing of A's.
    let c_prompt = dispatcher.prompt_for("c").unwrap();
    assert!(c_prompt.contains(&"B".repeat(500)));
    assert!(!c_prompt.contains(&"B".repeat(501)));
    assert!(!c_prompt.contains("result-a"));
    let b_prompt = dispatcher.prompt_for("b").unwrap();
    assert!(b_prompt.contains("result-a"));

    // Final states were recorded as task_result memories.
    let records = fx
        .store
        .by_session(&fx.session_id, Some(MemoryType::TaskResult), 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn diamond_runs_middle_phase_concurrently() {
    let dispatcher = Arc::new(ScriptedDispatcher::new().with_delay(Duration::from_millis(80)));
    let fx = fixture(fast_settings(), Arc::clone(&dispatcher)).await;
    add_agent(&fx, "arch", AgentRole::Architect).await;
    add_agent(&fx, "be1", AgentRole::Backend).await;
    add_agent(&fx, "be2", AgentRole::Backend).await;
    add_agent(&fx, "qa", AgentRole::Tester).await;

    let tasks = vec![
        named_task("a", AgentRole::Architect, &[]),
        named_task("b", AgentRole::Backend, &["a"]),
        named_task("c", AgentRole::Backend, &["a"]),
        named_task("d", AgentRole::Tester, &["b", "c"]),
    ];
    let plan = fx
        .engine
        .create_plan(&fx.session_id, ExecutionStrategy::Parallel, tasks)
        .await
        .unwrap();
    assert_eq!(
        plan.phases,
        vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
            vec!["d".to_string()],
        ]
    );

    let report = fx.engine.execute_plan(&fx.session_id, None).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    // B and C ran at the same time on the two backend agents.
    assert!(dispatcher.max_concurrency() >= 2);

    // D sees both result summaries.
    let d_prompt = dispatcher.prompt_for("d").unwrap();
    assert!(d_prompt.contains("result-b"));
    assert!(d_prompt.contains("result-c"));
}

#[tokio::test]
async fn cycle_is_rejected_at_plan_creation() {
    let fx = fixture(fast_settings(), Arc::new(ScriptedDispatcher::new())).await;
    let tasks = vec![
        named_task("a", AgentRole::Backend, &["b"]),
        named_task("b", AgentRole::Backend, &["a"]),
    ];

    match fx
        .engine
        .create_plan(&fx.session_id, ExecutionStrategy::Parallel, tasks)
        .await
    {
        Err(NexusError::CycleDetected { path }) => {
            assert_eq!(path.len(), 3);
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"a".to_string()));
            assert!(path.contains(&"b".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn failure_cascades_cancellation_to_descendants() {
    let dispatcher = Arc::new(ScriptedDispatcher::new().failing("a"));
    let fx = fixture(fast_settings(), Arc::clone(&dispatcher)).await;
    add_agent(&fx, "be", AgentRole::Backend).await;

    let tasks = vec![
        named_task("a", AgentRole::Backend, &[]),
        named_task("b", AgentRole::Backend, &["a"]),
        named_task("c", AgentRole::Backend, &["b"]),
    ];
    fx.engine
        .create_plan(&fx.session_id, ExecutionStrategy::Parallel, tasks)
        .await
        .unwrap();

    let report = fx.engine.execute_plan(&fx.session_id, None).await.unwrap();
    assert_eq!(report.status, PlanStatus::Failed);
    assert!(report.cause.as_deref().unwrap().contains("a"));

    let a = report.plan.task("a").unwrap();
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(a.retry_count, 3);

    let b = report.plan.task("b").unwrap();
    assert_eq!(b.state, TaskState::Cancelled);
    assert_eq!(b.error.as_deref(), Some("dependency failed: a"));

    let c = report.plan.task("c").unwrap();
    assert_eq!(c.state, TaskState::Cancelled);
}

#[tokio::test]
async fn expired_approval_fails_the_gated_task() {
    let mut settings = fast_settings();
    settings.intervention.approval_deadline_secs = 0;
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let fx = fixture(settings, dispatcher).await;
    add_agent(&fx, "be", AgentRole::Backend).await;

    // The destructive-ops policy matches this metadata and gates the task.
    let task = named_task("wipe", AgentRole::Backend, &[])
        .with_metadata("operation_type", serde_json::json!("delete"));
    fx.engine
        .create_plan(&fx.session_id, ExecutionStrategy::Sequential, vec![task])
        .await
        .unwrap();

    let report = fx.engine.execute_plan(&fx.session_id, None).await.unwrap();
    assert_eq!(report.status, PlanStatus::Failed);

    let task = report.plan.task("wipe").unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.error.as_deref().unwrap().contains("expired"));

    let expired = fx
        .interventions
        .session_interventions(&fx.session_id, Some(InterventionStatus::Expired))
        .await;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].task_id, "wipe");
}

#[tokio::test]
async fn approved_gate_lets_the_task_run() {
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let fx = fixture(fast_settings(), Arc::clone(&dispatcher)).await;
    add_agent(&fx, "be", AgentRole::Backend).await;

    let task = named_task("wipe", AgentRole::Backend, &[])
        .with_metadata("operation_type", serde_json::json!("delete"));
    fx.engine
        .create_plan(&fx.session_id, ExecutionStrategy::Sequential, vec![task])
        .await
        .unwrap();

    // Approve the gate as soon as it shows up.
    let interventions = Arc::clone(&fx.interventions);
    let session_id = fx.session_id.clone();
    let approver = tokio::spawn(async move {
        for _ in 0..200 {
            let waiting = interventions
                .session_interventions(
                    &session_id,
                    Some(InterventionStatus::WaitingForHuman),
                )
                .await;
            if let Some(point) = waiting.first() {
                interventions
                    .resolve(
                        &point.id,
                        memnexus::orchestrator::intervention::Resolution::approve(),
                        "operator",
                    )
                    .await;
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    });

    let report = fx.engine.execute_plan(&fx.session_id, None).await.unwrap();
    assert!(approver.await.unwrap(), "gate never appeared");
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(
        report.plan.task("wipe").unwrap().result.as_deref(),
        Some("result-wipe")
    );
}

#[tokio::test]
async fn review_strategy_appends_reviewer_tasks() {
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let fx = fixture(fast_settings(), Arc::clone(&dispatcher)).await;
    add_agent(&fx, "be", AgentRole::Backend).await;
    add_agent(&fx, "rev", AgentRole::Reviewer).await;

    let tasks = vec![named_task("impl", AgentRole::Backend, &[])];
    fx.engine
        .create_plan(&fx.session_id, ExecutionStrategy::Review, tasks)
        .await
        .unwrap();

    let report = fx.engine.execute_plan(&fx.session_id, None).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.plan.tasks.len(), 2);

    let review = report.plan.task("review_impl").unwrap();
    assert_eq!(review.state, TaskState::Completed);
    assert_eq!(review.role, AgentRole::Reviewer);

    // The reviewer saw the original result.
    let review_prompt = dispatcher.prompt_for("Review: impl").unwrap();
    assert!(review_prompt.contains("result-impl"));
}

#[tokio::test]
async fn progress_events_track_state_transitions() {
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let fx = fixture(fast_settings(), dispatcher).await;
    add_agent(&fx, "be", AgentRole::Backend).await;

    fx.engine
        .create_plan(
            &fx.session_id,
            ExecutionStrategy::Sequential,
            vec![named_task("t", AgentRole::Backend, &[])],
        )
        .await
        .unwrap();

    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let on_event: memnexus::orchestrator::engine::ProgressCallback =
        Arc::new(move |event| sink.lock().unwrap().push(event));
    let report = fx
        .engine
        .execute_plan(&fx.session_id, Some(on_event))
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let events = events.lock().unwrap();
    assert!(events.iter().all(|e| e.event_type == "task_progress"));
    assert!(events.iter().all(|e| e.task_id == "t"));
    let states: Vec<String> = events
        .iter()
        .filter_map(|e| e.data.get("state").and_then(|s| s.as_str().map(String::from)))
        .collect();
    assert_eq!(states.first().map(String::as_str), Some("assigned"));
    assert_eq!(states.last().map(String::as_str), Some("completed"));
    assert!(states.contains(&"running".to_string()));
}
