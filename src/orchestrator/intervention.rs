//! Human intervention gates.
//!
//! Execution pauses at intervention points until a human resolves them, a
//! policy auto-approves them, or their deadline expires. A point never
//! regresses: once terminal it stays terminal, and double resolution is a
//! no-op that returns the already-resolved point.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::InterventionSettings;
use crate::error::{NexusError, NexusResult};
use crate::util::{short_id, truncate_chars};

/// What kind of human action a point asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    /// Approval required before proceeding.
    Approval,
    /// Review of produced output.
    Review,
    /// A multiple-choice decision.
    Decision,
    /// Modification of task parameters.
    Modification,
    /// Manual pause.
    Pause,
    /// Progress checkpoint.
    Checkpoint,
    /// An error needing attention.
    Error,
}

/// Lifecycle of an intervention point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    /// Created, not yet surfaced.
    Pending,
    /// Surfaced and waiting on a human.
    WaitingForHuman,
    /// Approved.
    Approved,
    /// Rejected.
    Rejected,
    /// Changes requested.
    Modified,
    /// Overridden by an operator.
    Overridden,
    /// Deadline elapsed.
    Expired,
    /// Cancelled.
    Cancelled,
}

impl InterventionStatus {
    /// Whether the point can still change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            InterventionStatus::Pending | InterventionStatus::WaitingForHuman
        )
    }
}

/// One selectable option on a decision point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOption {
    /// Option identifier.
    pub id: String,
    /// Display label.
    pub label: String,
    /// Action applied when chosen.
    pub action: ResolutionAction,
}

/// The action a resolver takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Let execution continue.
    Approve,
    /// Stop the gated work.
    Reject,
    /// Request changes.
    Modify,
}

impl ResolutionAction {
    fn status(&self) -> InterventionStatus {
        match self {
            ResolutionAction::Approve => InterventionStatus::Approved,
            ResolutionAction::Reject => InterventionStatus::Rejected,
            ResolutionAction::Modify => InterventionStatus::Modified,
        }
    }
}

/// Resolution payload recorded on a point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// What was decided.
    pub action: ResolutionAction,
    /// Optional free-form note.
    pub message: Option<String>,
}

impl Resolution {
    /// Approve with no note.
    pub fn approve() -> Self {
        Self {
            action: ResolutionAction::Approve,
            message: None,
        }
    }

    /// Reject with no note.
    pub fn reject() -> Self {
        Self {
            action: ResolutionAction::Reject,
            message: None,
        }
    }
}

/// A suspension of task progress awaiting human resolution or expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionPoint {
    /// Opaque 8-char identifier.
    pub id: String,
    /// Kind of action requested.
    pub kind: InterventionKind,
    /// Task being gated.
    pub task_id: String,
    /// Owning session.
    pub session_id: String,
    /// Short title.
    pub title: String,
    /// Detailed description or content under review.
    pub description: String,
    /// Free-form context evaluated by policies.
    pub context: HashMap<String, serde_json::Value>,
    /// Options, for decision points.
    pub options: Vec<DecisionOption>,
    /// Optional hard deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Current status.
    pub status: InterventionStatus,
    /// Who created the point.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Resolution time, once terminal.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// Recorded resolution.
    pub resolution: Option<Resolution>,
}

impl InterventionPoint {
    fn new(
        kind: InterventionKind,
        session_id: &str,
        task_id: &str,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: short_id(),
            kind,
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            title: title.into(),
            description: description.into(),
            context: HashMap::new(),
            options: Vec::new(),
            deadline: None,
            status: InterventionStatus::Pending,
            created_by: "system".to_string(),
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            resolution: None,
        }
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Utc::now() > d).unwrap_or(false)
    }

    /// Seconds left before the deadline, if one is set.
    pub fn time_remaining(&self) -> Option<f64> {
        self.deadline.map(|d| {
            let remaining = (d - Utc::now()).num_milliseconds() as f64 / 1000.0;
            remaining.max(0.0)
        })
    }
}

/// Comparison operator in a policy trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    /// Exact equality.
    Equals,
    /// Negated equality.
    NotEquals,
    /// Substring match on the stringified value.
    Contains,
    /// Numeric greater-than.
    GreaterThan,
    /// Numeric less-than.
    LessThan,
}

/// One trigger condition over a context map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    /// Context key inspected.
    pub field: String,
    /// Comparison operator.
    pub operator: ConditionOp,
    /// Comparison operand.
    pub value: serde_json::Value,
}

impl TriggerCondition {
    /// Build a condition.
    pub fn new(field: impl Into<String>, operator: ConditionOp, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    fn matches(&self, context: &HashMap<String, serde_json::Value>) -> bool {
        let actual = context.get(&self.field);
        match self.operator {
            ConditionOp::Equals => actual == Some(&self.value),
            ConditionOp::NotEquals => actual != Some(&self.value),
            ConditionOp::Contains => {
                let needle = match &self.value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let haystack = match actual {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return false,
                };
                haystack.contains(&needle)
            }
            ConditionOp::GreaterThan => match (actual.and_then(|v| v.as_f64()), self.value.as_f64())
            {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            ConditionOp::LessThan => match (actual.and_then(|v| v.as_f64()), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
        }
    }
}

/// A named rule mapping context to an intervention decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionPolicy {
    /// Policy name.
    pub name: String,
    /// Any matching condition triggers the policy.
    pub trigger_conditions: Vec<TriggerCondition>,
    /// Auto-approve matching points after this many seconds of inaction.
    pub auto_approve_after_secs: Option<u64>,
    /// Operation names that always require approval.
    pub require_approval_for: Vec<String>,
    /// Channels to notify.
    pub notify_channels: Vec<String>,
    /// Escalate after this many seconds of inaction.
    pub escalation_timeout_secs: Option<u64>,
}

impl InterventionPolicy {
    /// Policy with a name and no rules yet.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger_conditions: Vec::new(),
            auto_approve_after_secs: None,
            require_approval_for: Vec::new(),
            notify_channels: vec!["web".to_string(), "log".to_string()],
            escalation_timeout_secs: None,
        }
    }

    /// Whether any trigger condition matches the context.
    pub fn should_intervene(&self, context: &HashMap<String, serde_json::Value>) -> bool {
        self.trigger_conditions.iter().any(|c| c.matches(context))
    }
}

/// Callback invoked on every intervention state change.
pub type InterventionCallback = Arc<dyn Fn(InterventionPoint) + Send + Sync>;

/// Registry of intervention points, keyed by id and indexed by session and
/// task.
pub struct InterventionRegistry {
    settings: InterventionSettings,
    points: RwLock<HashMap<String, InterventionPoint>>,
    by_session: RwLock<HashMap<String, Vec<String>>>,
    by_task: RwLock<HashMap<String, Vec<String>>>,
    policies: RwLock<HashMap<String, InterventionPolicy>>,
    waiters: StdMutex<HashMap<String, oneshot::Sender<InterventionPoint>>>,
    callbacks: RwLock<Vec<InterventionCallback>>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl InterventionRegistry {
    /// Registry with the three built-in policies installed.
    pub fn new(settings: InterventionSettings) -> Self {
        let mut policies = HashMap::new();
        for policy in Self::default_policies() {
            policies.insert(policy.name.clone(), policy);
        }
        Self {
            settings,
            points: RwLock::new(HashMap::new()),
            by_session: RwLock::new(HashMap::new()),
            by_task: RwLock::new(HashMap::new()),
            policies: RwLock::new(policies),
            waiters: StdMutex::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            monitor: StdMutex::new(None),
        }
    }

    fn default_policies() -> Vec<InterventionPolicy> {
        let mut destructive = InterventionPolicy::named("destructive_ops");
        destructive.trigger_conditions = vec![
            TriggerCondition::new("operation_type", ConditionOp::Equals, "delete".into()),
            TriggerCondition::new("operation_type", ConditionOp::Equals, "drop".into()),
        ];
        destructive.require_approval_for =
            vec!["delete".to_string(), "drop".to_string(), "remove".to_string()];

        let mut expensive = InterventionPolicy::named("expensive_ops");
        expensive.trigger_conditions = vec![TriggerCondition::new(
            "estimated_cost",
            ConditionOp::GreaterThan,
            100.into(),
        )];
        expensive.auto_approve_after_secs = Some(300);
        expensive.notify_channels = vec!["web".to_string()];

        let mut escalation = InterventionPolicy::named("error_escalation");
        escalation.trigger_conditions = vec![TriggerCondition::new(
            "error_count",
            ConditionOp::GreaterThan,
            3.into(),
        )];
        escalation.escalation_timeout_secs = Some(600);
        escalation.notify_channels =
            vec!["web".to_string(), "log".to_string(), "email".to_string()];

        vec![destructive, expensive, escalation]
    }

    /// Start the deadline/auto-approval monitor.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        let interval = self.settings.monitor_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        }));
    }

    /// Stop the monitor and drop all waiters.
    pub fn shutdown(&self) {
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            monitor.abort();
        }
        self.waiters.lock().unwrap().clear();
    }

    async fn register(&self, mut point: InterventionPoint) -> InterventionPoint {
        point.status = InterventionStatus::WaitingForHuman;
        self.by_session
            .write()
            .await
            .entry(point.session_id.clone())
            .or_default()
            .push(point.id.clone());
        self.by_task
            .write()
            .await
            .entry(point.task_id.clone())
            .or_default()
            .push(point.id.clone());
        self.points
            .write()
            .await
            .insert(point.id.clone(), point.clone());
        info!(
            intervention = %point.id,
            session = %point.session_id,
            kind = ?point.kind,
            "intervention point created"
        );
        self.notify(point.clone()).await;
        point
    }

    async fn notify(&self, point: InterventionPoint) {
        for callback in self.callbacks.read().await.iter() {
            callback(point.clone());
        }
    }

    /// Request approval before a task proceeds.
    pub async fn request_approval(
        &self,
        session_id: &str,
        task_id: &str,
        title: impl Into<String>,
        description: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
        timeout: Option<Duration>,
    ) -> InterventionPoint {
        let mut point =
            InterventionPoint::new(InterventionKind::Approval, session_id, task_id, title, description);
        point.context = context;
        point.deadline = timeout
            .map(|t| Utc::now() + chrono::Duration::milliseconds(t.as_millis() as i64));
        self.register(point).await
    }

    /// Request review of produced content.
    pub async fn request_review(
        &self,
        session_id: &str,
        task_id: &str,
        title: impl Into<String>,
        content: impl Into<String>,
        timeout: Option<Duration>,
    ) -> InterventionPoint {
        let mut point =
            InterventionPoint::new(InterventionKind::Review, session_id, task_id, title, content);
        point.options = vec![
            DecisionOption {
                id: "approve".to_string(),
                label: "Approve".to_string(),
                action: ResolutionAction::Approve,
            },
            DecisionOption {
                id: "reject".to_string(),
                label: "Reject".to_string(),
                action: ResolutionAction::Reject,
            },
            DecisionOption {
                id: "modify".to_string(),
                label: "Request Changes".to_string(),
                action: ResolutionAction::Modify,
            },
        ];
        point.deadline = timeout
            .map(|t| Utc::now() + chrono::Duration::milliseconds(t.as_millis() as i64));
        self.register(point).await
    }

    /// Ask the human to pick among options.
    pub async fn request_decision(
        &self,
        session_id: &str,
        task_id: &str,
        title: impl Into<String>,
        question: impl Into<String>,
        options: Vec<DecisionOption>,
    ) -> InterventionPoint {
        let mut point =
            InterventionPoint::new(InterventionKind::Decision, session_id, task_id, title, question);
        point.options = options;
        self.register(point).await
    }

    /// Record a progress checkpoint.
    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        task_id: &str,
        title: impl Into<String>,
        progress: f64,
    ) -> InterventionPoint {
        let mut point = InterventionPoint::new(
            InterventionKind::Checkpoint,
            session_id,
            task_id,
            title,
            format!("Progress: {:.1}%", progress * 100.0),
        );
        point
            .context
            .insert("progress".to_string(), serde_json::json!(progress));
        self.register(point).await
    }

    /// Surface an error for human attention.
    pub async fn report_error(
        &self,
        session_id: &str,
        task_id: &str,
        error: &str,
        severity: &str,
    ) -> InterventionPoint {
        let mut point = InterventionPoint::new(
            InterventionKind::Error,
            session_id,
            task_id,
            format!("Error: {}", truncate_chars(error, 50)),
            error,
        );
        point
            .context
            .insert("severity".to_string(), serde_json::json!(severity));
        self.register(point).await
    }

    /// Resolve a point. Resolving an already-terminal point is a no-op that
    /// returns it unchanged.
    pub async fn resolve(
        &self,
        intervention_id: &str,
        resolution: Resolution,
        resolved_by: &str,
    ) -> Option<InterventionPoint> {
        let updated = {
            let mut points = self.points.write().await;
            let point = points.get_mut(intervention_id)?;
            if point.status.is_terminal() {
                return Some(point.clone());
            }
            point.status = resolution.action.status();
            point.resolved_at = Some(Utc::now());
            point.resolved_by = Some(resolved_by.to_string());
            point.resolution = Some(resolution);
            point.clone()
        };

        info!(
            intervention = %updated.id,
            status = ?updated.status,
            by = %resolved_by,
            "intervention resolved"
        );
        self.fulfil(&updated);
        self.notify(updated.clone()).await;
        Some(updated)
    }

    fn fulfil(&self, point: &InterventionPoint) {
        if let Some(waiter) = self.waiters.lock().unwrap().remove(&point.id) {
            let _ = waiter.send(point.clone());
        }
    }

    /// Wait until a point reaches a terminal state.
    ///
    /// Expired points are returned (status `Expired`), not errored; callers
    /// decide whether to treat expiry as rejection. A `timeout` bounds the
    /// wait itself.
    pub async fn wait_for_resolution(
        &self,
        intervention_id: &str,
        timeout: Option<Duration>,
    ) -> NexusResult<InterventionPoint> {
        {
            let points = self.points.read().await;
            let point = points
                .get(intervention_id)
                .ok_or_else(|| NexusError::InvalidInput(format!(
                    "unknown intervention: {intervention_id}"
                )))?;
            if point.status.is_terminal() {
                return Ok(point.clone());
            }
        }

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(intervention_id.to_string(), tx);

        let resolved = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.waiters.lock().unwrap().remove(intervention_id);
                    return Err(NexusError::RequestTimeout(limit));
                }
            },
            None => rx.await,
        };
        resolved.map_err(|_| NexusError::InterventionExpired(intervention_id.to_string()))
    }

    /// Look up a point by id.
    pub async fn get(&self, intervention_id: &str) -> Option<InterventionPoint> {
        self.points.read().await.get(intervention_id).cloned()
    }

    /// A session's points, newest first, optionally filtered by status.
    pub async fn session_interventions(
        &self,
        session_id: &str,
        status: Option<InterventionStatus>,
    ) -> Vec<InterventionPoint> {
        let ids = self
            .by_session
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        let points = self.points.read().await;
        let mut found: Vec<InterventionPoint> = ids
            .iter()
            .filter_map(|id| points.get(id))
            .filter(|p| status.map(|s| p.status == s).unwrap_or(true))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    /// Every point still waiting on a human.
    pub async fn pending(&self) -> Vec<InterventionPoint> {
        self.points
            .read()
            .await
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Register a state-change callback.
    pub async fn add_callback(&self, callback: InterventionCallback) {
        self.callbacks.write().await.push(callback);
    }

    /// Install or replace a policy.
    pub async fn add_policy(&self, policy: InterventionPolicy) {
        self.policies
            .write()
            .await
            .insert(policy.name.clone(), policy);
    }

    /// Evaluate one policy against a context map.
    pub async fn check_policy(
        &self,
        name: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> bool {
        self.policies
            .read()
            .await
            .get(name)
            .map(|p| p.should_intervene(context))
            .unwrap_or(false)
    }

    /// Whether any installed policy would gate this context.
    pub async fn requires_intervention(
        &self,
        context: &HashMap<String, serde_json::Value>,
    ) -> bool {
        self.policies
            .read()
            .await
            .values()
            .any(|p| p.should_intervene(context))
    }

    /// One monitor pass: expire overdue points and auto-approve points whose
    /// matching policy's `auto_approve_after` window has elapsed.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let policies: Vec<InterventionPolicy> =
            self.policies.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        let mut auto_approve = Vec::new();
        {
            let points = self.points.read().await;
            for point in points.values() {
                if point.status.is_terminal() {
                    continue;
                }
                if point.is_expired() {
                    expired.push(point.id.clone());
                    continue;
                }
                let elapsed = (now - point.created_at).num_seconds().max(0) as u64;
                for policy in &policies {
                    let Some(window) = policy.auto_approve_after_secs else {
                        continue;
                    };
                    if elapsed >= window && policy.should_intervene(&point.context) {
                        auto_approve.push((point.id.clone(), policy.name.clone()));
                        break;
                    }
                }
            }
        }

        for id in expired {
            self.expire(&id).await;
        }
        for (id, policy) in auto_approve {
            debug!(intervention = %id, %policy, "auto-approving after policy window");
            self.resolve(
                &id,
                Resolution {
                    action: ResolutionAction::Approve,
                    message: Some(format!("auto-approved by policy {policy}")),
                },
                "system",
            )
            .await;
        }
    }

    async fn expire(&self, intervention_id: &str) {
        let updated = {
            let mut points = self.points.write().await;
            let Some(point) = points.get_mut(intervention_id) else {
                return;
            };
            if point.status.is_terminal() {
                return;
            }
            point.status = InterventionStatus::Expired;
            point.resolved_at = Some(Utc::now());
            point.clone()
        };
        warn!(intervention = %intervention_id, "intervention expired");
        self.fulfil(&updated);
        self.notify(updated).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InterventionRegistry {
        InterventionRegistry::new(InterventionSettings {
            monitor_interval_ms: 20,
            approval_deadline_secs: 600,
        })
    }

    #[tokio::test]
    async fn approval_lifecycle_and_idempotent_resolution() {
        let registry = registry();
        let point = registry
            .request_approval("sess1", "t1", "Deploy", "Ship to prod?", HashMap::new(), None)
            .await;
        assert_eq!(point.status, InterventionStatus::WaitingForHuman);

        let resolved = registry
            .resolve(&point.id, Resolution::approve(), "alice")
            .await
            .unwrap();
        assert_eq!(resolved.status, InterventionStatus::Approved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("alice"));

        // Second resolution is a no-op returning the settled point.
        let again = registry
            .resolve(&point.id, Resolution::reject(), "bob")
            .await
            .unwrap();
        assert_eq!(again.status, InterventionStatus::Approved);
        assert_eq!(again.resolved_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn waiter_receives_the_resolution_exactly_once() {
        let registry = Arc::new(registry());
        let point = registry
            .request_review("sess1", "t1", "Review", "the diff", None)
            .await;

        let waiter = {
            let registry = Arc::clone(&registry);
            let id = point.id.clone();
            tokio::spawn(async move { registry.wait_for_resolution(&id, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry
            .resolve(
                &point.id,
                Resolution {
                    action: ResolutionAction::Modify,
                    message: Some("tighten tests".to_string()),
                },
                "carol",
            )
            .await
            .unwrap();

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.status, InterventionStatus::Modified);
    }

    #[tokio::test]
    async fn waiting_on_a_resolved_point_returns_immediately() {
        let registry = registry();
        let point = registry
            .request_approval("sess1", "t1", "x", "", HashMap::new(), None)
            .await;
        registry
            .resolve(&point.id, Resolution::approve(), "human")
            .await
            .unwrap();

        let resolved = registry.wait_for_resolution(&point.id, None).await.unwrap();
        assert_eq!(resolved.status, InterventionStatus::Approved);
    }

    #[tokio::test]
    async fn deadline_expiry_reaches_waiters() {
        let registry = Arc::new(registry());
        let point = registry
            .request_approval(
                "sess1",
                "t1",
                "slow",
                "",
                HashMap::new(),
                Some(Duration::from_millis(30)),
            )
            .await;

        let waiter = {
            let registry = Arc::clone(&registry);
            let id = point.id.clone();
            tokio::spawn(async move { registry.wait_for_resolution(&id, None).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.sweep().await;

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.status, InterventionStatus::Expired);

        // Terminal states never regress.
        let after = registry
            .resolve(&point.id, Resolution::approve(), "late")
            .await
            .unwrap();
        assert_eq!(after.status, InterventionStatus::Expired);
    }

    #[tokio::test]
    async fn monitor_task_expires_points() {
        let registry = Arc::new(registry());
        registry.start();
        let point = registry
            .request_approval(
                "sess1",
                "t1",
                "auto",
                "",
                HashMap::new(),
                Some(Duration::from_millis(30)),
            )
            .await;

        let resolved = registry
            .wait_for_resolution(&point.id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(resolved.status, InterventionStatus::Expired);
        registry.shutdown();
    }

    #[tokio::test]
    async fn condition_operators() {
        let ctx = HashMap::from([
            ("operation_type".to_string(), serde_json::json!("delete")),
            ("estimated_cost".to_string(), serde_json::json!(250)),
            ("path".to_string(), serde_json::json!("src/db/schema.sql")),
        ]);

        let eq = TriggerCondition::new("operation_type", ConditionOp::Equals, "delete".into());
        assert!(eq.matches(&ctx));
        let neq = TriggerCondition::new("operation_type", ConditionOp::NotEquals, "drop".into());
        assert!(neq.matches(&ctx));
        let contains = TriggerCondition::new("path", ConditionOp::Contains, "schema".into());
        assert!(contains.matches(&ctx));
        let gt = TriggerCondition::new("estimated_cost", ConditionOp::GreaterThan, 100.into());
        assert!(gt.matches(&ctx));
        let lt = TriggerCondition::new("estimated_cost", ConditionOp::LessThan, 100.into());
        assert!(!lt.matches(&ctx));
        let missing = TriggerCondition::new("absent", ConditionOp::Equals, "x".into());
        assert!(!missing.matches(&ctx));
    }

    #[tokio::test]
    async fn built_in_policies_are_installed() {
        let registry = registry();
        let destructive = HashMap::from([(
            "operation_type".to_string(),
            serde_json::json!("drop"),
        )]);
        assert!(registry.check_policy("destructive_ops", &destructive).await);
        assert!(registry.requires_intervention(&destructive).await);

        let cheap = HashMap::from([("estimated_cost".to_string(), serde_json::json!(10))]);
        assert!(!registry.check_policy("expensive_ops", &cheap).await);
        assert!(!registry.check_policy("no_such_policy", &cheap).await);
    }

    #[tokio::test]
    async fn matching_policy_auto_approves_after_window() {
        let registry = registry();
        let mut policy = InterventionPolicy::named("instant_green_light");
        policy.trigger_conditions = vec![TriggerCondition::new(
            "kind",
            ConditionOp::Equals,
            "routine".into(),
        )];
        policy.auto_approve_after_secs = Some(0);
        registry.add_policy(policy).await;

        let matching = registry
            .request_approval(
                "sess1",
                "t1",
                "routine op",
                "",
                HashMap::from([("kind".to_string(), serde_json::json!("routine"))]),
                None,
            )
            .await;
        let unrelated = registry
            .request_approval("sess1", "t2", "odd op", "", HashMap::new(), None)
            .await;

        registry.sweep().await;

        let matching = registry.get(&matching.id).await.unwrap();
        assert_eq!(matching.status, InterventionStatus::Approved);
        assert_eq!(matching.resolved_by.as_deref(), Some("system"));

        let unrelated = registry.get(&unrelated.id).await.unwrap();
        assert_eq!(unrelated.status, InterventionStatus::WaitingForHuman);
    }

    #[tokio::test]
    async fn session_index_sorts_newest_first() {
        let registry = registry();
        let first = registry
            .request_approval("sess1", "t1", "first", "", HashMap::new(), None)
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = registry
            .request_approval("sess1", "t2", "second", "", HashMap::new(), None)
            .await;
        registry
            .request_approval("sess2", "t3", "elsewhere", "", HashMap::new(), None)
            .await;

        let all = registry.session_interventions("sess1", None).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);
        assert_eq!(all[1].id, first.id);

        registry
            .resolve(&first.id, Resolution::approve(), "h")
            .await
            .unwrap();
        let waiting = registry
            .session_interventions("sess1", Some(InterventionStatus::WaitingForHuman))
            .await;
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, second.id);
    }

    #[tokio::test]
    async fn callbacks_fire_on_create_and_resolve() {
        let registry = registry();
        let seen: Arc<StdMutex<Vec<InterventionStatus>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry
            .add_callback(Arc::new(move |point| {
                sink.lock().unwrap().push(point.status);
            }))
            .await;

        let point = registry
            .report_error("sess1", "t1", "task blew up", "error")
            .await;
        assert_eq!(point.kind, InterventionKind::Error);
        assert!(point.title.starts_with("Error: "));

        registry
            .resolve(&point.id, Resolution::approve(), "h")
            .await
            .unwrap();

        let statuses = seen.lock().unwrap().clone();
        assert_eq!(
            statuses,
            vec![
                InterventionStatus::WaitingForHuman,
                InterventionStatus::Approved
            ]
        );
    }
}
