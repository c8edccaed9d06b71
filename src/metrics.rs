//! Prometheus telemetry for the orchestration core.
//!
//! All metrics hang off an owned registry so embedding applications can
//! expose several cores side by side; nothing registers globally.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::NexusResult;
use crate::orchestrator::engine::TaskState;
use crate::orchestrator::intervention::InterventionStatus;

/// Counter set for one MemNexus core.
pub struct NexusMetrics {
    registry: Registry,
    /// Task state transitions, labelled by resulting state.
    pub task_transitions: IntCounterVec,
    /// Memory records written through the store.
    pub records_stored: IntCounter,
    /// Sync events published on session topics.
    pub sync_events: IntCounter,
    /// Intervention state changes, labelled by status.
    pub interventions: IntCounterVec,
    /// Prompts dispatched to agents.
    pub prompts_dispatched: IntCounter,
    /// Live sessions.
    pub active_sessions: IntGauge,
}

impl NexusMetrics {
    /// Build and register the metric set on a fresh registry.
    pub fn new() -> NexusResult<Self> {
        let registry = Registry::new();

        let task_transitions = IntCounterVec::new(
            Opts::new("memnexus_task_transitions_total", "Task state transitions"),
            &["state"],
        )?;
        let records_stored = IntCounter::new(
            "memnexus_memory_records_total",
            "Memory records written through the store",
        )?;
        let sync_events = IntCounter::new(
            "memnexus_sync_events_total",
            "Sync events published on session topics",
        )?;
        let interventions = IntCounterVec::new(
            Opts::new(
                "memnexus_interventions_total",
                "Intervention state changes",
            ),
            &["status"],
        )?;
        let prompts_dispatched = IntCounter::new(
            "memnexus_prompts_dispatched_total",
            "Prompts dispatched to agents",
        )?;
        let active_sessions =
            IntGauge::new("memnexus_active_sessions", "Sessions currently registered")?;

        registry.register(Box::new(task_transitions.clone()))?;
        registry.register(Box::new(records_stored.clone()))?;
        registry.register(Box::new(sync_events.clone()))?;
        registry.register(Box::new(interventions.clone()))?;
        registry.register(Box::new(prompts_dispatched.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            registry,
            task_transitions,
            records_stored,
            sync_events,
            interventions,
            prompts_dispatched,
            active_sessions,
        })
    }

    /// Count a task transition.
    pub fn task_transition(&self, state: TaskState) {
        let label = serde_json::to_value(state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{state:?}"));
        self.task_transitions
            .with_label_values(&[label.as_str()])
            .inc();
    }

    /// Count an intervention state change.
    pub fn intervention(&self, status: InterventionStatus) {
        let label = serde_json::to_value(status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{status:?}"));
        self.interventions
            .with_label_values(&[label.as_str()])
            .inc();
    }

    /// Text exposition of every metric.
    pub fn gather(&self) -> NexusResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_appear_in_exposition() {
        let metrics = NexusMetrics::new().unwrap();
        metrics.task_transition(TaskState::Completed);
        metrics.task_transition(TaskState::Completed);
        metrics.task_transition(TaskState::Failed);
        metrics.records_stored.inc();
        metrics.intervention(InterventionStatus::Approved);
        metrics.active_sessions.set(2);

        let text = metrics.gather().unwrap();
        assert!(text.contains("memnexus_task_transitions_total{state=\"completed\"} 2"));
        assert!(text.contains("memnexus_task_transitions_total{state=\"failed\"} 1"));
        assert!(text.contains("memnexus_memory_records_total 1"));
        assert!(text.contains("memnexus_interventions_total{status=\"approved\"} 1"));
        assert!(text.contains("memnexus_active_sessions 2"));
    }

    #[test]
    fn registries_are_isolated() {
        let a = NexusMetrics::new().unwrap();
        let b = NexusMetrics::new().unwrap();
        a.records_stored.inc();
        assert!(b.gather().unwrap().contains("memnexus_memory_records_total 0"));
    }
}
