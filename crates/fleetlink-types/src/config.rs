//! Hub configuration types.
//!
//! Every section carries serde defaults so a partial `config.toml` loads.

use crate::filter::EventFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Top-level hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the HTTP surface binds to.
    pub listen_addr: String,
    /// Identifier the hub presents in outbound handshakes.
    pub hub_id: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Bearer token required on `/api/*`. Empty disables auth.
    pub api_key: String,
    pub reconnect: ReconnectConfig,
    pub security: SecurityConfig,
    pub commands: CommandConfig,
    pub peers: Vec<PeerConfig>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7420".to_string(),
            hub_id: "fleetlink-hub".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            api_key: String::new(),
            reconnect: ReconnectConfig::default(),
            security: SecurityConfig::default(),
            commands: CommandConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Check the configuration for inconsistencies. Returns one message per
    /// problem; an empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!("listen_addr '{}' is not a socket address", self.listen_addr));
        }

        let r = &self.reconnect;
        if r.base_interval_ms == 0 {
            problems.push("reconnect.base_interval_ms must be > 0".to_string());
        }
        if r.multiplier < 1.0 {
            problems.push("reconnect.multiplier must be >= 1.0".to_string());
        }
        if r.max_interval_ms < r.base_interval_ms {
            problems.push("reconnect.max_interval_ms must be >= base_interval_ms".to_string());
        }

        let s = &self.security;
        if s.rate_limit_window_ms == 0 || s.rate_limit_max_requests == 0 {
            problems.push("security rate limit window and budget must be > 0".to_string());
        }
        if s.suspicious_window_ms == 0 || s.suspicious_threshold == 0 {
            problems.push("security suspicious window and threshold must be > 0".to_string());
        }
        if s.ddos_requests_per_second == 0 {
            problems.push("security.ddos_requests_per_second must be > 0".to_string());
        }

        if self.commands.default_timeout_ms == 0 {
            problems.push("commands.default_timeout_ms must be > 0".to_string());
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.server_id.trim().is_empty() {
                problems.push("peer with empty server_id".to_string());
                continue;
            }
            if !seen.insert(peer.server_id.as_str()) {
                problems.push(format!("duplicate server_id '{}'", peer.server_id));
            }
            match &peer.transport {
                TransportConfig::OutboundSocket {
                    url,
                    handshake_timeout_ms,
                    heartbeat_interval_ms,
                } => {
                    if url.trim().is_empty() {
                        problems.push(format!("peer '{}': outbound url is empty", peer.server_id));
                    }
                    if *handshake_timeout_ms == 0 || *heartbeat_interval_ms == 0 {
                        problems.push(format!(
                            "peer '{}': handshake_timeout_ms and heartbeat_interval_ms must be > 0",
                            peer.server_id
                        ));
                    }
                }
                TransportConfig::InboundSocket { .. } => {}
                TransportConfig::LocalBridge {
                    base_url,
                    poll_interval_ms,
                    request_timeout_ms,
                } => {
                    if base_url.trim().is_empty() {
                        problems.push(format!("peer '{}': local bridge base_url is empty", peer.server_id));
                    }
                    if *poll_interval_ms == 0 || *request_timeout_ms == 0 {
                        problems.push(format!(
                            "peer '{}': poll_interval_ms and request_timeout_ms must be > 0",
                            peer.server_id
                        ));
                    }
                }
                TransportConfig::Process {
                    command,
                    stop_command,
                    ..
                } => {
                    if command.trim().is_empty() {
                        problems.push(format!("peer '{}': process command is empty", peer.server_id));
                    }
                    if stop_command.trim().is_empty() || stop_command.contains(['\r', '\n']) {
                        problems.push(format!(
                            "peer '{}': stop_command must be a single non-empty line",
                            peer.server_id
                        ));
                    }
                }
            }
        }

        problems
    }
}

/// Backoff policy for reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// When false, managers start disabled.
    pub enabled: bool,
    pub base_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
    /// Go to `Disabled` once `max_attempts` is exhausted.
    pub disable_on_max_attempts: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_interval_ms: 5_000,
            multiplier: 1.5,
            max_interval_ms: 60_000,
            max_attempts: 10,
            disable_on_max_attempts: true,
        }
    }
}

/// Command execution defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Timeout applied when a caller does not pass one.
    pub default_timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

/// Security gate tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// When false the gate admits everything but still emits headers.
    pub enabled: bool,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    pub suspicious_window_ms: u64,
    pub suspicious_threshold: u32,
    pub suspicious_decay_ms: u64,
    /// Each failure counts this many times toward the suspicion score.
    pub failure_weight: u32,
    /// Failures added for a request to a known probe path.
    pub probe_weight: u32,
    pub probe_paths: Vec<String>,
    /// Case-insensitive substrings; a matching user agent is blocked.
    pub blocked_user_agents: Vec<String>,
    pub ddos_requests_per_second: u32,
    pub emergency_cooldown_ms: u64,
    /// IPs that bypass the gate entirely.
    pub allow_list: Vec<String>,
    /// Identities idle longer than this are evicted by `sweep`.
    pub idle_ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 120,
            suspicious_window_ms: 10_000,
            suspicious_threshold: 60,
            suspicious_decay_ms: 300_000,
            failure_weight: 3,
            probe_weight: 10,
            probe_paths: vec![
                "/.env".to_string(),
                "/.git".to_string(),
                "/wp-admin".to_string(),
                "/wp-login.php".to_string(),
                "/phpmyadmin".to_string(),
            ],
            blocked_user_agents: vec![
                "sqlmap".to_string(),
                "nikto".to_string(),
                "masscan".to_string(),
                "zgrab".to_string(),
            ],
            ddos_requests_per_second: 500,
            emergency_cooldown_ms: 30_000,
            allow_list: Vec::new(),
            idle_ttl_ms: 600_000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// One managed peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub server_id: String,
    /// Display name; defaults to the server id.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub transport: TransportConfig,
    /// Subscriptions registered when the bridge is created.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl PeerConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.server_id
        } else {
            &self.name
        }
    }
}

fn default_true() -> bool {
    true
}

/// A pre-registered event subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub op: String,
    #[serde(default)]
    pub filter: Option<EventFilter>,
}

/// Transport strategy for a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Hub dials the peer's WebSocket endpoint.
    OutboundSocket {
        url: String,
        #[serde(default = "default_handshake_timeout_ms")]
        handshake_timeout_ms: u64,
        #[serde(default = "default_heartbeat_interval_ms")]
        heartbeat_interval_ms: u64,
    },
    /// Peer dials the hub's `/wbp/connect` endpoint.
    InboundSocket {
        /// Shared token the peer must present. Empty accepts any peer.
        #[serde(default)]
        token: String,
    },
    /// Peer exposes an HTTP endpoint on localhost.
    LocalBridge {
        base_url: String,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
    /// Hub spawns the engine and drives its console.
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
        #[serde(default = "default_stop_command")]
        stop_command: String,
        #[serde(default = "default_settle_ms")]
        settle_ms: u64,
        #[serde(default = "default_shutdown_grace_ms")]
        shutdown_grace_ms: u64,
    },
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_heartbeat_interval_ms() -> u64 {
    15_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_stop_command() -> String {
    "stop".to_string()
}
fn default_settle_ms() -> u64 {
    1_500
}
fn default_shutdown_grace_ms() -> u64 {
    10_000
}

/// Discriminant of [`TransportConfig`], reported in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    OutboundSocket,
    InboundSocket,
    LocalBridge,
    Process,
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::OutboundSocket { .. } => TransportKind::OutboundSocket,
            TransportConfig::InboundSocket { .. } => TransportKind::InboundSocket,
            TransportConfig::LocalBridge { .. } => TransportKind::LocalBridge,
            TransportConfig::Process { .. } => TransportKind::Process,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::OutboundSocket => "outbound_socket",
            TransportKind::InboundSocket => "inbound_socket",
            TransportKind::LocalBridge => "local_bridge",
            TransportKind::Process => "process",
        };
        f.write_str(s)
    }
}
