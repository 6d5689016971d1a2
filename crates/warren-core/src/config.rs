//! Configuration system for Warren.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $WARREN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/warren/config.toml
//!   3. ~/.config/warren/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarrenConfig {
    pub transport: TransportConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub client: ClientConfig,
}

/// Reliability and liveness knobs for the datagram protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// First retransmission interval for probes, headers and parts.
    pub retransmit_interval_ms: u64,
    /// Upper bound for the doubling retransmission interval.
    pub max_retransmit_interval_ms: u64,
    /// Silent rounds tolerated before a send fails.
    pub max_retransmits: u32,
    /// Bound on waiting for a handshake answer.
    pub handshake_timeout_ms: u64,
    /// Keepalive period on established connections.
    pub keepalive_interval_ms: u64,
    /// A peer silent for this long is considered disconnected.
    pub peer_timeout_ms: u64,
    /// Receiver acknowledges after this many new parts.
    pub ack_every: u32,
    /// How long a completed inbound transfer keeps answering duplicates.
    pub linger_ms: u64,
    /// Pending accepted connections before new probes are dropped.
    pub accept_backlog: usize,
    /// SO_RCVBUF requested for the endpoint socket. 0 = OS default.
    pub recv_buffer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Period of the scheduler snapshot log. 0 = disabled.
    pub snapshot_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Self-declared identifier announced at registration.
    pub id: String,
    /// Broker `host:port`.
    pub broker: String,
    /// Cores offered to the broker. 0 = available parallelism.
    pub cores: u32,
    /// Jobs executed at once. 0 = `cores`.
    pub max_concurrent_jobs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub id: String,
    pub broker: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retransmit_interval_ms: 200,
            max_retransmit_interval_ms: 2_000,
            max_retransmits: 8,
            handshake_timeout_ms: 5_000,
            keepalive_interval_ms: 2_000,
            peer_timeout_ms: 15_000,
            ack_every: 32,
            linger_ms: 5_000,
            accept_backlog: 64,
            recv_buffer_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_BROKER_PORT,
            snapshot_interval_secs: 10,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: "worker".to_string(),
            broker: default_broker(),
            cores: 0,
            max_concurrent_jobs: 0,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: "client".to_string(),
            broker: default_broker(),
        }
    }
}

/// Default broker UDP port.
pub const DEFAULT_BROKER_PORT: u16 = 12345;

fn default_broker() -> String {
    format!("127.0.0.1:{DEFAULT_BROKER_PORT}")
}

impl TransportConfig {
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    pub fn max_retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.max_retransmit_interval_ms.max(self.retransmit_interval_ms))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    /// Reject values the endpoint cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("transport.retransmit_interval_ms", self.retransmit_interval_ms),
            ("transport.handshake_timeout_ms", self.handshake_timeout_ms),
            ("transport.keepalive_interval_ms", self.keepalive_interval_ms),
            ("transport.peer_timeout_ms", self.peer_timeout_ms),
            ("transport.ack_every", u64::from(self.ack_every)),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.peer_timeout_ms <= self.keepalive_interval_ms {
            return Err(ConfigError::Invalid {
                field: "transport.peer_timeout_ms",
                reason: format!(
                    "must exceed keepalive_interval_ms ({})",
                    self.keepalive_interval_ms
                ),
            });
        }
        Ok(())
    }
}

impl BrokerConfig {
    /// Snapshot log period, `None` when disabled.
    pub fn snapshot_interval(&self) -> Option<Duration> {
        match self.snapshot_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl WorkerConfig {
    /// Cores to announce, resolving 0 to the machine's parallelism.
    pub fn effective_cores(&self) -> u32 {
        if self.cores == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        } else {
            self.cores
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("warren")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl WarrenConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            WarrenConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("WARREN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&WarrenConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Check every section. Called by [`load`](Self::load) after overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()
    }

    /// Apply WARREN_* overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("WARREN_BROKER__BIND_ADDR") {
            self.broker.bind_addr = v;
        }
        if let Some(p) = lookup("WARREN_BROKER__PORT").and_then(|v| v.parse().ok()) {
            self.broker.port = p;
        }
        if let Some(v) = lookup("WARREN_WORKER__ID") {
            self.worker.id = v;
        }
        if let Some(v) = lookup("WARREN_WORKER__BROKER") {
            self.worker.broker = v;
        }
        if let Some(c) = lookup("WARREN_WORKER__CORES").and_then(|v| v.parse().ok()) {
            self.worker.cores = c;
        }
        if let Some(v) = lookup("WARREN_CLIENT__ID") {
            self.client.id = v;
        }
        if let Some(v) = lookup("WARREN_CLIENT__BROKER") {
            self.client.broker = v;
        }
        if let Some(n) = lookup("WARREN_TRANSPORT__MAX_RETRANSMITS").and_then(|v| v.parse().ok()) {
            self.transport.max_retransmits = n;
        }
        if let Some(ms) = lookup("WARREN_TRANSPORT__PEER_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.transport.peer_timeout_ms = ms;
        }
    }
}
