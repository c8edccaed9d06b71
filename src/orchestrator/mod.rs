//! Orchestration: dependency graph, scheduler, human gates, plan engine.

pub mod engine;
pub mod graph;
pub mod intervention;
pub mod scheduler;

pub use engine::{
    AcpDispatcher, ExecutionPlan, OrchestratorEngine, PlanReport, PlanStatus, ProgressCallback,
    ProgressEvent, PromptDispatcher, Task, TaskState,
};
pub use graph::DependencyGraph;
pub use intervention::{
    ConditionOp, DecisionOption, InterventionCallback, InterventionKind, InterventionPoint,
    InterventionPolicy, InterventionRegistry, InterventionStatus, Resolution, ResolutionAction,
    TriggerCondition,
};
pub use scheduler::{Bottleneck, Schedule, Suggestion, TaskScheduler};
