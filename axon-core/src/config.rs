use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse env var {key}={value}: {message}")]
    Parse {
        key: &'static str,
        value: String,
        message: String,
    },
}

/// Configuration surface consumed, not owned, by the coordination core.
///
/// Every field has an env override (`AXON_*`) so an embedding application
/// can configure the core without touching code.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Identity of this process on the wire (sender/recipient id)
    pub node_id: String,
    /// Address of the external broker process, host:port
    pub broker_addr: String,
    /// Bind address for the direct transport listener (port 0 = ephemeral)
    pub direct_bind_addr: String,
    /// Root of the shared-storage mailbox
    pub mailbox_dir: PathBuf,
    /// Directory scanned once at startup for launchable agent programs
    pub agents_dir: PathBuf,
    /// Interval between transport liveness probes
    pub probe_interval: Duration,
    /// Interval between mailbox inbox scans
    pub mailbox_poll_interval: Duration,
    /// Base delay before the first ack retry; doubles per attempt
    pub ack_timeout: Duration,
    /// Resends after the initial attempt before DeliveryFailed
    pub max_retries: u32,
    /// Upper bound on the exponential backoff
    pub retry_backoff_cap: Duration,
    /// Default TTL granted to capability advertisements without one
    pub capability_ttl: Duration,
    /// Interval between registry eviction sweeps
    pub eviction_interval: Duration,
    /// How long an expired advertisement survives while its agent is
    /// confirmed starting/ready
    pub eviction_grace: Duration,
    /// How long a freshly launched agent may take to advertise
    pub launch_grace: Duration,
    /// Interval between readiness polls during launch_grace
    pub ready_poll_interval: Duration,
    /// How long a dispatch waits for an existing provider before
    /// attempting a launch
    pub discovery_timeout: Duration,
    /// How long a dispatched node waits for its correlated result
    pub node_timeout: Duration,
    /// Request-level deadline for a whole task graph
    pub run_timeout: Duration,
    /// SIGTERM grace before an agent process is force-killed
    pub shutdown_grace: Duration,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            node_id: env_str("AXON_NODE_ID", &format!("axon-{}", ulid::Ulid::new())),
            broker_addr: env_str("AXON_BROKER_ADDR", "127.0.0.1:18830"),
            direct_bind_addr: env_str("AXON_DIRECT_BIND", "127.0.0.1:0"),
            mailbox_dir: PathBuf::from(env_str("AXON_MAILBOX_DIR", "./data/mailbox")),
            agents_dir: PathBuf::from(env_str("AXON_AGENTS_DIR", "./agents")),
            probe_interval: env_secs("AXON_PROBE_INTERVAL_SECS", 60)?,
            mailbox_poll_interval: env_millis("AXON_MAILBOX_POLL_MS", 500)?,
            ack_timeout: env_millis("AXON_ACK_TIMEOUT_MS", 5_000)?,
            max_retries: env_parse("AXON_MAX_RETRIES", 3)?,
            retry_backoff_cap: env_secs("AXON_RETRY_BACKOFF_CAP_SECS", 30)?,
            capability_ttl: env_secs("AXON_CAPABILITY_TTL_SECS", 300)?,
            eviction_interval: env_secs("AXON_EVICTION_INTERVAL_SECS", 30)?,
            eviction_grace: env_secs("AXON_EVICTION_GRACE_SECS", 10)?,
            launch_grace: env_secs("AXON_LAUNCH_GRACE_SECS", 10)?,
            ready_poll_interval: env_millis("AXON_READY_POLL_MS", 250)?,
            discovery_timeout: env_millis("AXON_DISCOVERY_TIMEOUT_MS", 2_000)?,
            node_timeout: env_secs("AXON_NODE_TIMEOUT_SECS", 120)?,
            run_timeout: env_secs("AXON_RUN_TIMEOUT_SECS", 600)?,
            shutdown_grace: env_secs("AXON_SHUTDOWN_GRACE_SECS", 5)?,
        })
    }

    /// Defaults with an explicit node id, handy for embedding and tests.
    pub fn with_node_id(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            broker_addr: "127.0.0.1:18830".to_string(),
            direct_bind_addr: "127.0.0.1:0".to_string(),
            mailbox_dir: PathBuf::from("./data/mailbox"),
            agents_dir: PathBuf::from("./agents"),
            probe_interval: Duration::from_secs(60),
            mailbox_poll_interval: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff_cap: Duration::from_secs(30),
            capability_ttl: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(30),
            eviction_grace: Duration::from_secs(10),
            launch_grace: Duration::from_secs(10),
            ready_poll_interval: Duration::from_millis(250),
            discovery_timeout: Duration::from_secs(2),
            node_timeout: Duration::from_secs(120),
            run_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val.parse::<T>().map_err(|e| ConfigError::Parse {
            key,
            value: val,
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(key, default)?))
}

fn env_millis(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(env_parse(key, default)?))
}
