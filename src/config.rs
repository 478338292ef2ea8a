//! Configuration types.
//!
//! The agent reads a single JSON application file. Every section carries
//! defaults, so a partial (or missing) file still yields a runnable config.
//! A handful of environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default location of the application file.
pub const DEFAULT_CONFIG_PATH: &str = "config/application.json";

/// Name of the stop sentinel, resolved next to the timeline file.
pub const STOP_SENTINEL_NAME: &str = "stop.txt";

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Control plane base URL, including the `/api` suffix.
    pub api_root_url: String,
    /// Whether the orchestrator runs the local timeline.
    pub handlers_is_enabled: bool,
    pub timeline: TimelineSettings,
    pub listener: ListenerSettings,
    pub sockets: SocketSettings,
    pub client_updates: CycleSettings,
    pub client_results: CycleSettings,
    pub resource_control: ResourceControlSettings,
    /// Directory for the client id, results log and health file.
    pub instance_directory: PathBuf,
    /// Directory for the rolling application log.
    pub log_directory: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_root_url: "http://localhost:5000/api".to_string(),
            handlers_is_enabled: true,
            timeline: TimelineSettings::default(),
            listener: ListenerSettings::default(),
            sockets: SocketSettings::default(),
            client_updates: CycleSettings::default(),
            client_results: CycleSettings {
                is_enabled: true,
                cycle_sleep: 90_000,
            },
            resource_control: ResourceControlSettings::default(),
            instance_directory: PathBuf::from("instance"),
            log_directory: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimelineSettings {
    pub location: PathBuf,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            location: PathBuf::from("config/timeline.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerSettings {
    /// TCP port for ad-hoc handlers. 0 disables the socket listener.
    pub port: u16,
    /// Drop directory for ad-hoc timelines. Empty disables the directory listener.
    pub directory: PathBuf,
    /// Glob that dropped files must match.
    pub pattern: String,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            port: 0,
            directory: PathBuf::from("instance/timeline/in"),
            pattern: "*.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketSettings {
    pub is_enabled: bool,
    /// Heartbeat period in milliseconds.
    pub heartbeat: u64,
    /// Pause between reconnect attempts in milliseconds.
    pub reconnect_delay: u64,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            is_enabled: true,
            heartbeat: 50_000,
            reconnect_delay: 5_000,
        }
    }
}

impl SocketSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.max(1_000))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay)
    }
}

/// A polling cycle (update retrieval or result posting).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CycleSettings {
    pub is_enabled: bool,
    /// Sleep between cycles in milliseconds.
    pub cycle_sleep: u64,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            is_enabled: true,
            cycle_sleep: 60_000,
        }
    }
}

impl CycleSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.cycle_sleep.max(1_000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceControlSettings {
    /// Whether the safety net runs and whether stop performs a hard-kill pass.
    pub manage_processes: bool,
    pub safety_net_interval_secs: u64,
    /// Pause between stop and restart on a timeline reload.
    pub reload_settle_millis: u64,
    /// Upper bound on waiting for a cancelled job to exit.
    pub stop_grace_secs: u64,
}

impl Default for ResourceControlSettings {
    fn default() -> Self {
        Self {
            manage_processes: true,
            safety_net_interval_secs: 300, // 5 minutes
            reload_settle_millis: 7_500,
            stop_grace_secs: 10,
        }
    }
}

impl ResourceControlSettings {
    pub fn safety_net_interval(&self) -> Duration {
        Duration::from_secs(self.safety_net_interval_secs.max(1))
    }

    pub fn reload_settle(&self) -> Duration {
        Duration::from_millis(self.reload_settle_millis)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl AgentConfig {
    /// Load configuration from a JSON file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply environment overrides on top of the file values.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var("GHOSTS_API_URL") {
            self.api_root_url = url;
        }

        if let Ok(path) = std::env::var("GHOSTS_TIMELINE") {
            self.timeline.location = PathBuf::from(path);
        }

        if let Ok(port) = std::env::var("GHOSTS_LISTENER_PORT") {
            self.listener.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "GHOSTS_LISTENER_PORT".to_string(),
                message: format!("'{port}' is not a port number"),
            })?;
        }

        if let Ok(flag) = std::env::var("GHOSTS_SOCKETS_ENABLED") {
            self.sockets.is_enabled = parse_bool(&flag).ok_or_else(|| ConfigError::InvalidValue {
                key: "GHOSTS_SOCKETS_ENABLED".to_string(),
                message: format!("'{flag}' is not a boolean"),
            })?;
        }

        Ok(self)
    }

    /// Path of the stop sentinel (next to the timeline file).
    pub fn stop_sentinel_path(&self) -> PathBuf {
        self.timeline
            .location
            .parent()
            .map(|dir| dir.join(STOP_SENTINEL_NAME))
            .unwrap_or_else(|| PathBuf::from(STOP_SENTINEL_NAME))
    }

    pub fn id_file(&self) -> PathBuf {
        self.instance_directory.join("id.json")
    }

    pub fn results_log(&self) -> PathBuf {
        self.instance_directory.join("clientupdates.log")
    }

    pub fn health_file(&self) -> PathBuf {
        self.instance_directory.join("health.json")
    }

    pub fn urls(&self) -> ControlPlaneUrls {
        ControlPlaneUrls::new(&self.api_root_url)
    }
}

/// Control plane endpoints derived from the API root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneUrls {
    pub id: String,
    pub updates: String,
    pub results: String,
    pub survey: String,
    pub timeline: String,
    pub socket: String,
}

impl ControlPlaneUrls {
    pub fn new(api_root: &str) -> Self {
        let root = api_root.trim_end_matches('/');
        let base = root.strip_suffix("/api").unwrap_or(root);
        let socket_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };

        Self {
            id: format!("{root}/clientid"),
            updates: format!("{root}/clientupdates"),
            results: format!("{root}/clientresults"),
            survey: format!("{root}/clientsurvey"),
            timeline: format!("{root}/clienttimeline"),
            socket: format!("{socket_base}/clientHub"),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
