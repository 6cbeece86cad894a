//! Lifecycle management for agent OS processes.
//!
//! Launchable agent programs are discovered once at startup by scanning a
//! directory for executables; the catalog is cached for the process
//! lifetime. Launched agents are handed their identity and messaging
//! configuration through `AXON_*` environment variables and are considered
//! ready only once the capability registry has seen an advertisement from
//! them — a process can be alive without being ready.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::registry::{AgentStatusSource, CapabilityRegistry};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("agent '{0}' is not in the discovered catalog")]
    UnknownAgent(String),
    #[error("agent '{0}' is already running")]
    AlreadyRunning(String),
    #[error("failed to spawn agent '{name}': {message}")]
    SpawnFailed { name: String, message: String },
    #[error("agent '{name}' did not become ready within {timeout:?}")]
    AgentLaunchFailed { name: String, timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Starting,
    Ready,
    Running,
    Stopping,
    Dead,
}

struct AgentProcess {
    launched_at: DateTime<Utc>,
    status: AgentStatus,
    pid: Option<u32>,
    child: Option<Child>,
}

/// Snapshot of one tracked agent, for introspection.
#[derive(Debug, Clone)]
pub struct AgentProcessInfo {
    pub agent_name: String,
    pub pid: Option<u32>,
    pub launched_at: DateTime<Utc>,
    pub status: AgentStatus,
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub launch_grace: Duration,
    pub ready_poll_interval: Duration,
    pub shutdown_grace: Duration,
    /// Extra environment handed to every launched agent (mailbox dir,
    /// broker address, ...).
    pub env: Vec<(String, String)>,
}

pub struct AgentManager {
    catalog: HashMap<String, PathBuf>,
    entries: Mutex<HashMap<String, AgentProcess>>,
    registry: Arc<CapabilityRegistry>,
    options: LaunchOptions,
}

impl AgentManager {
    /// One-time scan of `dir` for launchable agent programs. On unix a file
    /// qualifies if any execute bit is set; the catalog key is the file
    /// stem (`data_analysis_agent.sh` -> `data_analysis_agent`).
    pub async fn discover(dir: &Path) -> std::io::Result<HashMap<String, PathBuf>> {
        let mut catalog = HashMap::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if !meta.is_file() || !is_executable(&meta) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            catalog.insert(stem.to_string(), path.clone());
        }
        info!(
            dir = %dir.display(),
            count = catalog.len(),
            "agent catalog discovered"
        );
        Ok(catalog)
    }

    pub fn new(
        catalog: HashMap<String, PathBuf>,
        registry: Arc<CapabilityRegistry>,
        options: LaunchOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            entries: Mutex::new(HashMap::new()),
            registry,
            options,
        })
    }

    pub fn known_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start an agent process. Refuses while an instance with this name is
    /// still alive; returns as soon as the process is spawned.
    pub async fn launch(&self, name: &str) -> Result<u32, LifecycleError> {
        let path = self
            .catalog
            .get(name)
            .ok_or_else(|| LifecycleError::UnknownAgent(name.to_string()))?;

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(name) {
            let alive = match entry.child.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            };
            if alive {
                return Err(LifecycleError::AlreadyRunning(name.to_string()));
            }
            entries.remove(name);
        }

        let mut command = Command::new(path);
        command
            .env("AXON_AGENT_ID", name)
            .envs(self.options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(false);

        match command.spawn() {
            Ok(child) => {
                let pid = child.id();
                entries.insert(
                    name.to_string(),
                    AgentProcess {
                        launched_at: Utc::now(),
                        status: AgentStatus::Starting,
                        pid,
                        child: Some(child),
                    },
                );
                info!(agent = name, pid, "agent launched");
                Ok(pid.unwrap_or_default())
            }
            Err(e) => {
                entries.insert(
                    name.to_string(),
                    AgentProcess {
                        launched_at: Utc::now(),
                        status: AgentStatus::Dead,
                        pid: None,
                        child: None,
                    },
                );
                Err(LifecycleError::SpawnFailed {
                    name: name.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Poll the registry until the agent advertises, bounded by both a max
    /// attempt count and the wall-clock deadline.
    pub async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<(), LifecycleError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = self.options.ready_poll_interval.max(Duration::from_millis(10));
        let max_attempts = (timeout.as_millis() / poll.as_millis()).max(1) as u64;

        for _attempt in 0..=max_attempts {
            {
                let mut entries = self.entries.lock().await;
                let entry = entries
                    .get_mut(name)
                    .ok_or_else(|| LifecycleError::UnknownAgent(name.to_string()))?;
                if let Some(child) = entry.child.as_mut() {
                    if matches!(child.try_wait(), Ok(Some(_))) {
                        entry.status = AgentStatus::Dead;
                        entry.child = None;
                        warn!(agent = name, "agent exited before becoming ready");
                        return Err(LifecycleError::AgentLaunchFailed {
                            name: name.to_string(),
                            timeout,
                        });
                    }
                }
            }

            if self.registry.has_agent(name).await {
                if let Some(entry) = self.entries.lock().await.get_mut(name) {
                    entry.status = AgentStatus::Ready;
                }
                info!(agent = name, "agent ready");
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }

        Err(LifecycleError::AgentLaunchFailed {
            name: name.to_string(),
            timeout,
        })
    }

    /// Ready agents transition to running once work is routed to them.
    pub async fn note_dispatch(&self, name: &str) {
        if let Some(entry) = self.entries.lock().await.get_mut(name) {
            if entry.status == AgentStatus::Ready {
                entry.status = AgentStatus::Running;
            }
        }
    }

    /// Graceful-then-forced termination. The record is removed regardless
    /// of which path was taken. Returns false for untracked agents.
    pub async fn shutdown(&self, name: &str) -> bool {
        let entry = self.entries.lock().await.remove(name);
        let Some(mut entry) = entry else {
            warn!(agent = name, "shutdown requested for untracked agent");
            return false;
        };

        entry.status = AgentStatus::Stopping;
        if let Some(mut child) = entry.child.take() {
            terminate_gracefully(&mut child);
            match tokio::time::timeout(self.options.shutdown_grace, child.wait()).await {
                Ok(_) => info!(agent = name, "agent terminated"),
                Err(_) => {
                    warn!(agent = name, "agent ignored termination signal, killing");
                    let _ = child.kill().await;
                }
            }
        }
        true
    }

    /// Best-effort shutdown of every tracked agent.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        for name in names {
            self.shutdown(&name).await;
        }
    }

    pub async fn status(&self, name: &str) -> Option<AgentStatus> {
        self.entries.lock().await.get(name).map(|entry| entry.status)
    }

    pub async fn processes(&self) -> Vec<AgentProcessInfo> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(name, entry)| AgentProcessInfo {
                agent_name: name.clone(),
                pid: entry.pid,
                launched_at: entry.launched_at,
                status: entry.status,
            })
            .collect()
    }
}

#[async_trait]
impl AgentStatusSource for AgentManager {
    async fn is_starting_or_ready(&self, agent_id: &str) -> bool {
        matches!(
            self.status(agent_id).await,
            Some(AgentStatus::Starting | AgentStatus::Ready)
        )
    }
}

#[cfg(unix)]
fn terminate_gracefully(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}
