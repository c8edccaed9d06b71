//! Strategy-aware task scheduling.
//!
//! Wraps the dependency graph and produces an execution schedule per
//! strategy, plus bottleneck analysis and scaling suggestions.

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{NexusError, NexusResult};
use crate::orchestrator::engine::Task;
use crate::orchestrator::graph::DependencyGraph;
use crate::session::{AgentRole, ExecutionStrategy};

/// Assumed average task duration for estimates.
const MINUTES_PER_TASK: i64 = 2;

/// Dependents beyond which a task counts as a fan-out bottleneck.
const FANOUT_THRESHOLD: usize = 3;

/// Critical-path length beyond which a chain counts as a bottleneck.
const CHAIN_THRESHOLD: usize = 5;

/// Same-role tasks in one phase beyond which scaling is suggested.
const ROLE_PHASE_THRESHOLD: usize = 2;

/// A computed execution schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Owning session.
    pub session_id: String,
    /// Strategy the phases were computed for.
    pub strategy: ExecutionStrategy,
    /// Task ids grouped by execution phase.
    pub phases: Vec<Vec<String>>,
    /// Rough wall-clock estimate.
    #[serde(with = "duration_secs")]
    pub estimated_duration: Duration,
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.num_seconds().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(deserializer)?))
    }
}

impl Schedule {
    /// Index of the first phase with unfinished tasks.
    pub fn current_phase(&self, completed: &HashSet<String>) -> usize {
        for (index, phase) in self.phases.iter().enumerate() {
            if !phase.iter().all(|id| completed.contains(id)) {
                return index;
            }
        }
        self.phases.len()
    }

    /// How parallel the schedule is: 0.0 fully sequential, 1.0 fully
    /// parallel.
    pub fn parallelization_factor(&self) -> f64 {
        if self.phases.is_empty() {
            return 0.0;
        }
        let total: usize = self.phases.iter().map(Vec::len).sum();
        if total <= 1 {
            return 0.0;
        }
        let avg_per_phase = total as f64 / self.phases.len() as f64;
        (avg_per_phase - 1.0) / (total as f64 - 1.0)
    }
}

/// A detected scheduling bottleneck.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Bottleneck {
    /// A task with many direct dependents.
    HighFanout {
        /// The choke-point task.
        task_id: String,
        /// How many tasks wait on it.
        dependents: usize,
    },
    /// A long critical path.
    LongChain {
        /// Number of tasks on the path.
        length: usize,
        /// The path itself.
        path: Vec<String>,
    },
}

/// A suggested schedule optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Suggestion {
    /// The graph is mostly sequential; consider loosening dependencies.
    IncreaseParallelism,
    /// A phase is saturated with one role; consider more agents of it.
    AgentScaling {
        /// The saturated role.
        role: AgentRole,
        /// Tasks of that role in the phase.
        count: usize,
        /// Which phase.
        phase: usize,
    },
}

/// Builds schedules from a task set.
#[derive(Default)]
pub struct TaskScheduler {
    graph: DependencyGraph,
    roles: HashMap<String, AgentRole>,
}

impl TaskScheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and its dependencies.
    pub fn add_task(&mut self, task: &Task) {
        self.graph.add_task(&task.id, &task.dependencies);
        self.roles.insert(task.id.clone(), task.role);
    }

    /// Forget a task.
    pub fn remove_task(&mut self, task_id: &str) {
        self.graph.remove_task(task_id);
        self.roles.remove(task_id);
    }

    /// Underlying graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Compute a schedule for a strategy.
    ///
    /// `available_agents` only affects the `auto` strategy, which packs
    /// phases so no phase wants more agents of a role than exist.
    pub fn create_schedule(
        &self,
        session_id: &str,
        strategy: ExecutionStrategy,
        available_agents: Option<&HashMap<AgentRole, usize>>,
    ) -> NexusResult<Schedule> {
        if let Some(path) = self.graph.detect_cycles() {
            return Err(NexusError::CycleDetected { path });
        }

        let phases = match strategy {
            ExecutionStrategy::Sequential => self
                .graph
                .topological_sort()?
                .into_iter()
                .map(|id| vec![id])
                .collect(),
            ExecutionStrategy::Parallel => self.graph.phases(),
            ExecutionStrategy::Review => {
                let mut phases = self.graph.phases();
                let review_phase: Vec<String> = self
                    .graph
                    .ids()
                    .into_iter()
                    .map(|id| format!("review_{id}"))
                    .collect();
                if !review_phase.is_empty() {
                    phases.push(review_phase);
                }
                phases
            }
            ExecutionStrategy::Auto => match available_agents {
                Some(available) => self.pack_phases(available),
                None => self.graph.phases(),
            },
        };

        let total: usize = phases.iter().map(Vec::len).sum();
        Ok(Schedule {
            session_id: session_id.to_string(),
            strategy,
            phases,
            estimated_duration: Duration::minutes(total as i64 * MINUTES_PER_TASK),
        })
    }

    /// Greedy packing for the `auto` strategy: tasks are considered in
    /// ascending dependency-count order and admitted to a phase only while
    /// agents of their role remain; overflow rolls into the next phase.
    fn pack_phases(&self, available: &HashMap<AgentRole, usize>) -> Vec<Vec<String>> {
        let mut phases: Vec<Vec<String>> = Vec::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut remaining: Vec<String> = self.graph.ids();
        remaining.sort_by_key(|id| (self.graph.dependencies(id).len(), id.clone()));

        while !remaining.is_empty() {
            let mut phase: Vec<String> = Vec::new();
            let mut role_usage: HashMap<AgentRole, usize> = HashMap::new();

            for task_id in &remaining {
                let deps_done = self
                    .graph
                    .dependencies(task_id)
                    .iter()
                    .all(|dep| completed.contains(dep) || !self.graph.contains(dep));
                if !deps_done {
                    continue;
                }
                let Some(role) = self.roles.get(task_id) else {
                    continue;
                };
                let capacity = available.get(role).copied().unwrap_or(1);
                let used = role_usage.entry(*role).or_insert(0);
                if *used < capacity {
                    *used += 1;
                    phase.push(task_id.clone());
                }
            }

            if phase.is_empty() {
                break;
            }
            completed.extend(phase.iter().cloned());
            remaining.retain(|id| !completed.contains(id));
            phases.push(phase);
        }
        phases
    }

    /// Report fan-out and chain-length bottlenecks.
    pub fn analyze_bottlenecks(&self) -> Vec<Bottleneck> {
        let mut bottlenecks = Vec::new();

        for task_id in self.graph.ids() {
            let dependents = self.graph.dependents(&task_id).len();
            if dependents > FANOUT_THRESHOLD {
                bottlenecks.push(Bottleneck::HighFanout { task_id, dependents });
            }
        }

        let path = self.graph.critical_path();
        if path.len() > CHAIN_THRESHOLD {
            bottlenecks.push(Bottleneck::LongChain {
                length: path.len(),
                path,
            });
        }
        bottlenecks
    }

    /// Suggest where to loosen dependencies or add agents.
    pub fn suggest_optimizations(&self) -> Vec<Suggestion> {
        let mut suggestions = Vec::new();
        let phases = self.graph.phases();

        if !phases.is_empty() && phases.len() * 2 > self.graph.len() {
            suggestions.push(Suggestion::IncreaseParallelism);
        }

        for (index, phase) in phases.iter().enumerate() {
            let mut counts: HashMap<AgentRole, usize> = HashMap::new();
            for task_id in phase {
                if let Some(role) = self.roles.get(task_id) {
                    *counts.entry(*role).or_insert(0) += 1;
                }
            }
            for (role, count) in counts {
                if count > ROLE_PHASE_THRESHOLD {
                    suggestions.push(Suggestion::AgentScaling {
                        role,
                        count,
                        phase: index,
                    });
                }
            }
        }
        suggestions
    }
}
