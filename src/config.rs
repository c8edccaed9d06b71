//! Configuration for the MemNexus core.
//!
//! Settings are plain data threaded into each component at construction
//! time. `from_env` reads `MEMNEXUS_*` variables with sensible fallbacks so
//! a bare environment still yields a working configuration.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level settings for a MemNexus deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Agent subprocess supervision.
    pub agent: AgentSettings,
    /// ACP protocol adapter.
    pub protocol: ProtocolSettings,
    /// Orchestrator engine and scheduler.
    pub orchestrator: OrchestratorSettings,
    /// Memory sync bus.
    pub sync: SyncSettings,
    /// Human intervention registry.
    pub intervention: InterventionSettings,
}

/// Supervision parameters for agent subprocesses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Grace window between SIGTERM and forced kill, in seconds.
    pub stop_grace_secs: u64,
    /// Per-task agent timeout in seconds.
    pub task_timeout_secs: u64,
}

/// ACP protocol adapter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Per-request JSON-RPC response timeout in seconds.
    pub request_timeout_secs: u64,
    /// Hard deadline for a single prompt stream in seconds.
    pub prompt_timeout_secs: u64,
}

/// Orchestrator engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Total time a task may wait on its dependencies, in seconds.
    pub dependency_wait_secs: u64,
    /// Dependency poll interval in milliseconds.
    pub dependency_poll_ms: u64,
    /// Agent starvation threshold in seconds; zero fails immediately.
    pub starvation_timeout_secs: u64,
    /// Default retry budget for tasks.
    pub max_retries: u32,
}

/// Sync bus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Bounded per-subscriber queue capacity.
    pub subscriber_queue: usize,
    /// Optional Redis URL for cross-instance fan-out.
    pub redis_url: Option<String>,
}

/// Intervention registry parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionSettings {
    /// Monitor wake interval in milliseconds.
    pub monitor_interval_ms: u64,
    /// Default deadline attached to orchestrator approval gates, in seconds.
    pub approval_deadline_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent: AgentSettings {
                stop_grace_secs: 5,
                task_timeout_secs: 300,
            },
            protocol: ProtocolSettings {
                request_timeout_secs: 30,
                prompt_timeout_secs: 300,
            },
            orchestrator: OrchestratorSettings {
                dependency_wait_secs: 300,
                dependency_poll_ms: 100,
                starvation_timeout_secs: 60,
                max_retries: 3,
            },
            sync: SyncSettings {
                subscriber_queue: 256,
                redis_url: None,
            },
            intervention: InterventionSettings {
                monitor_interval_ms: 5_000,
                approval_deadline_secs: 600,
            },
        }
    }
}

fn env_u64(key: &str, fallback: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn env_usize(key: &str, fallback: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            agent: AgentSettings {
                stop_grace_secs: env_u64("MEMNEXUS_STOP_GRACE", defaults.agent.stop_grace_secs),
                task_timeout_secs: env_u64(
                    "MEMNEXUS_AGENT_TIMEOUT",
                    defaults.agent.task_timeout_secs,
                ),
            },
            protocol: ProtocolSettings {
                request_timeout_secs: env_u64(
                    "MEMNEXUS_REQUEST_TIMEOUT",
                    defaults.protocol.request_timeout_secs,
                ),
                prompt_timeout_secs: env_u64(
                    "MEMNEXUS_PROMPT_TIMEOUT",
                    defaults.protocol.prompt_timeout_secs,
                ),
            },
            orchestrator: OrchestratorSettings {
                dependency_wait_secs: env_u64(
                    "MEMNEXUS_DEPENDENCY_WAIT",
                    defaults.orchestrator.dependency_wait_secs,
                ),
                dependency_poll_ms: env_u64(
                    "MEMNEXUS_DEPENDENCY_POLL_MS",
                    defaults.orchestrator.dependency_poll_ms,
                ),
                starvation_timeout_secs: env_u64(
                    "MEMNEXUS_STARVATION_TIMEOUT",
                    defaults.orchestrator.starvation_timeout_secs,
                ),
                max_retries: env_u64("MEMNEXUS_MAX_RETRIES", defaults.orchestrator.max_retries as u64)
                    as u32,
            },
            sync: SyncSettings {
                subscriber_queue: env_usize(
                    "MEMNEXUS_SUBSCRIBER_QUEUE",
                    defaults.sync.subscriber_queue,
                ),
                redis_url: env::var("MEMNEXUS_REDIS_URL").ok(),
            },
            intervention: InterventionSettings {
                monitor_interval_ms: env_u64(
                    "MEMNEXUS_MONITOR_INTERVAL_MS",
                    defaults.intervention.monitor_interval_ms,
                ),
                approval_deadline_secs: env_u64(
                    "MEMNEXUS_APPROVAL_DEADLINE",
                    defaults.intervention.approval_deadline_secs,
                ),
            },
        }
    }

    /// Validate cross-field constraints, returning every violation found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.protocol.request_timeout_secs == 0 {
            errors.push("request timeout must be greater than 0".to_string());
        }
        if self.protocol.prompt_timeout_secs < self.protocol.request_timeout_secs {
            errors.push("prompt timeout must not be shorter than the request timeout".to_string());
        }
        if self.orchestrator.dependency_poll_ms == 0 {
            errors.push("dependency poll interval must be greater than 0".to_string());
        }
        if self.sync.subscriber_queue == 0 {
            errors.push("subscriber queue capacity must be greater than 0".to_string());
        }
        if self.intervention.monitor_interval_ms == 0 {
            errors.push("intervention monitor interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl AgentSettings {
    /// Stop grace window as a `Duration`.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl ProtocolSettings {
    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Prompt deadline as a `Duration`.
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }
}

impl OrchestratorSettings {
    /// Dependency wait budget as a `Duration`.
    pub fn dependency_wait(&self) -> Duration {
        Duration::from_secs(self.dependency_wait_secs)
    }

    /// Dependency poll interval as a `Duration`.
    pub fn dependency_poll(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_ms)
    }

    /// Starvation threshold as a `Duration`.
    pub fn starvation_timeout(&self) -> Duration {
        Duration::from_secs(self.starvation_timeout_secs)
    }
}

impl InterventionSettings {
    /// Monitor interval as a `Duration`.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
