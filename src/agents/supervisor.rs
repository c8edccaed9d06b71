//! Agent subprocess supervision.
//!
//! The supervisor is the only component that touches the OS process behind
//! an agent. It resolves the CLI on PATH, spawns the child with the session
//! environment injected, pumps stdout/stderr line-by-line into registered
//! output callbacks, and enforces the graceful-then-forced stop policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{NexusError, NexusResult};

/// Callback receiving one prefixed output line.
pub type OutputCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Launch parameters for one agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProcessConfig {
    /// Agent name, used as the output prefix.
    pub name: String,
    /// Command line, whitespace-separated (e.g. `claude --acp`).
    pub cli: String,
    /// Working directory for the child.
    pub working_dir: String,
    /// Environment overlay applied on top of the injected variables.
    pub env: HashMap<String, String>,
}

impl AgentProcessConfig {
    /// Config with an empty overlay and the current directory.
    pub fn new(name: impl Into<String>, cli: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cli: cli.into(),
            working_dir: ".".to_string(),
            env: HashMap::new(),
        }
    }
}

/// A supervised agent subprocess.
pub struct AgentProcess {
    config: AgentProcessConfig,
    session_id: String,
    stop_grace: Duration,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    pid: std::sync::Mutex<Option<u32>>,
    callbacks: Arc<RwLock<Vec<OutputCallback>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentProcess {
    /// Build a supervisor for one agent; the process is not spawned yet.
    pub fn new(config: AgentProcessConfig, session_id: impl Into<String>, stop_grace: Duration) -> Self {
        Self {
            config,
            session_id: session_id.into(),
            stop_grace,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            pid: std::sync::Mutex::new(None),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Process id of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }

    /// Register an output callback. May be called before or after `start`.
    pub async fn on_output(&self, callback: OutputCallback) {
        self.callbacks.write().await.push(callback);
    }

    /// Spawn the subprocess.
    ///
    /// `capture_stdout` controls whether stdout is pumped into the output
    /// callbacks (wrapper mode) or left for `take_io` (protocol mode).
    /// Stderr is always captured. Injects `SESSION_ID`, `AGENT_NAME` and
    /// `ENABLED=1` plus the config's overlay.
    pub async fn start(&self, capture_stdout: bool) -> NexusResult<u32> {
        let mut child_slot = self.child.lock().await;
        if child_slot.is_some() {
            return Err(NexusError::SpawnFailed(format!(
                "agent {} is already running",
                self.config.name
            )));
        }

        let mut parts = self.config.cli.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| NexusError::SpawnFailed("empty command line".to_string()))?;
        let args: Vec<&str> = parts.collect();

        let resolved = which::which(program)
            .map_err(|_| NexusError::SpawnFailed(format!("executable not found on PATH: {program}")))?;

        let mut command = Command::new(resolved);
        command
            .args(&args)
            .current_dir(&self.config.working_dir)
            .env("SESSION_ID", &self.session_id)
            .env("AGENT_NAME", &self.config.name)
            .env("ENABLED", "1")
            .envs(&self.config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|err| NexusError::SpawnFailed(err.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| NexusError::SpawnFailed("child exited before start completed".to_string()))?;
        *self.pid.lock().unwrap() = Some(pid);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.stdin.lock().await = stdin;

        let mut readers = self.readers.lock().await;
        if let Some(stderr) = stderr {
            let callbacks = Arc::clone(&self.callbacks);
            let prefix = format!("[{}:stderr]", self.config.name);
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let message = format!("{prefix} {line}");
                    for callback in callbacks.read().await.iter() {
                        callback(message.clone());
                    }
                }
            }));
        }

        if capture_stdout {
            if let Some(stdout) = stdout {
                let callbacks = Arc::clone(&self.callbacks);
                let prefix = format!("[{}]", self.config.name);
                readers.push(tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let message = format!("{prefix} {line}");
                        for callback in callbacks.read().await.iter() {
                            callback(message.clone());
                        }
                    }
                }));
            }
        } else {
            *self.stdout.lock().await = stdout;
        }

        *child_slot = Some(child);
        info!(agent = %self.config.name, session = %self.session_id, pid, "agent subprocess started");
        Ok(pid)
    }

    /// Hand over the child's stdio for a protocol connection.
    ///
    /// Only available after `start(false)`; each stream can be taken once.
    pub async fn take_io(&self) -> Option<(ChildStdout, ChildStdin)> {
        let stdout = self.stdout.lock().await.take()?;
        let stdin = self.stdin.lock().await.take()?;
        Some((stdout, stdin))
    }

    /// Write one line to the child's stdin and flush.
    pub async fn send_input(&self, message: &str) -> NexusResult<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| NexusError::SendFailed("stdin is not available".to_string()))?;
        stdin
            .write_all(format!("{message}\n").as_bytes())
            .await
            .map_err(|err| NexusError::SendFailed(err.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|err| NexusError::SendFailed(err.to_string()))?;
        Ok(())
    }

    /// Stop the subprocess: graceful termination, a grace window, then a
    /// forced kill. The child is reaped and reader tasks are cancelled
    /// before this returns.
    pub async fn stop(&self) -> NexusResult<()> {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SIGTERM first so the agent can flush state.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(status) => {
                debug!(agent = %self.config.name, ?status, "agent exited within grace window");
            }
            Err(_) => {
                warn!(agent = %self.config.name, grace = ?self.stop_grace, "agent ignored termination, killing");
                child.kill().await?;
                child.wait().await?;
            }
        }

        for reader in self.readers.lock().await.drain(..) {
            reader.abort();
        }
        *self.pid.lock().unwrap() = None;
        *self.stdin.lock().await = None;
        *self.stdout.lock().await = None;
        info!(agent = %self.config.name, "agent subprocess stopped");
        Ok(())
    }

    /// Whether a child is currently attached.
    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }
}

/// Per-session collection of supervised agents.
pub struct AgentPool {
    session_id: String,
    stop_grace: Duration,
    agents: RwLock<HashMap<String, Arc<AgentProcess>>>,
}

impl AgentPool {
    /// Empty pool for a session.
    pub fn new(session_id: impl Into<String>, stop_grace: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            stop_grace,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn an agent in wrapper mode and register it under its name.
    pub async fn launch(
        &self,
        config: AgentProcessConfig,
        callback: Option<OutputCallback>,
    ) -> NexusResult<Arc<AgentProcess>> {
        let name = config.name.clone();
        let agent = Arc::new(AgentProcess::new(
            config,
            self.session_id.clone(),
            self.stop_grace,
        ));
        if let Some(callback) = callback {
            agent.on_output(callback).await;
        }
        agent.start(true).await?;
        self.agents.write().await.insert(name, Arc::clone(&agent));
        Ok(agent)
    }

    /// Spawn an agent in protocol mode: stdout is left untouched for an
    /// ACP connection to claim via `take_io`.
    pub async fn launch_protocol(
        &self,
        config: AgentProcessConfig,
    ) -> NexusResult<Arc<AgentProcess>> {
        let name = config.name.clone();
        let agent = Arc::new(AgentProcess::new(
            config,
            self.session_id.clone(),
            self.stop_grace,
        ));
        agent.start(false).await?;
        self.agents.write().await.insert(name, Arc::clone(&agent));
        Ok(agent)
    }

    /// Look up a running agent by name.
    pub async fn get(&self, name: &str) -> Option<Arc<AgentProcess>> {
        self.agents.read().await.get(name).cloned()
    }

    /// Stop and forget every agent in the pool.
    pub async fn stop_all(&self) -> NexusResult<()> {
        let agents: Vec<Arc<AgentProcess>> = self.agents.write().await.drain().map(|(_, a)| a).collect();
        for agent in agents {
            agent.stop().await?;
        }
        Ok(())
    }
}
