//! Configuration resolution for agentyard.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/agentyard/settings.json)
//! 3. Project config (.agentyard/settings.json)
//! 4. Environment variables (`AGENTYARD_*`)
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! Settings files are merged key by key, so a project file that only sets
//! `pool.min_idle` keeps every other value from the global file.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete agentyard configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
}

/// Task scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskConfig {
    /// Tasks allowed in `running`/`waiting_permission` at once.
    pub max_concurrent_tasks: usize,
    /// Grace period after an interrupt signal before the process is killed.
    pub interrupt_grace_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            interrupt_grace_ms: 3_000,
        }
    }
}

impl TaskConfig {
    pub const fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

/// Agent-server lease pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Warm candidates (warming or ready) kept ahead of demand.
    pub min_idle: usize,
    /// Upper bound on concurrently alive agent-server processes.
    pub max_total: usize,
    /// How long a spawned server may take to answer its health endpoint.
    pub startup_timeout_ms: u64,
    /// Return "use direct invocation" instead of an error when no lease can
    /// be produced.
    pub cold_start_fallback: bool,
    /// Delay between health polls of a warming candidate.
    pub health_poll_interval_ms: u64,
    /// Delay before a failed background refill is retried.
    pub refill_backoff_ms: u64,
    /// Consecutive background spawn failures before refilling pauses until
    /// the next acquire.
    pub max_refill_failures: u32,
    /// Return cleanly released leases to the warm set after a health check.
    pub reuse_released: bool,
    /// Agent CLI binary.
    pub agent_bin: PathBuf,
    /// Arguments for server mode; `{port}` is replaced with the assigned port.
    pub server_args: Vec<String>,
    /// Arguments for one-shot direct invocation.
    pub direct_args: Vec<String>,
    /// Working directory for spawned agents (defaults to the home directory).
    pub working_directory: Option<PathBuf>,
    /// Health endpoint path served by agent servers.
    pub health_path: String,
    /// JSON field that identifies a healthy agent server.
    pub health_marker: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_total: 4,
            startup_timeout_ms: 30_000,
            cold_start_fallback: true,
            health_poll_interval_ms: 250,
            refill_backoff_ms: 5_000,
            max_refill_failures: 3,
            reuse_released: true,
            agent_bin: PathBuf::from("agent"),
            server_args: vec!["serve".into(), "--port".into(), "{port}".into()],
            direct_args: vec!["run".into(), "--stdio".into()],
            working_directory: None,
            health_path: "/health".to_string(),
            health_marker: "serverId".to_string(),
        }
    }
}

impl PoolConfig {
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub const fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub const fn refill_backoff(&self) -> Duration {
        Duration::from_millis(self.refill_backoff_ms)
    }
}

/// Browser-automation port allocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortConfig {
    /// First candidate HTTP port (inclusive).
    pub range_start: u16,
    /// Last candidate HTTP port (inclusive).
    pub range_end: u16,
    /// Per-request timeout for classification probes.
    pub probe_timeout_ms: u64,
    /// JSON field that marks the HTTP port as served by our browser server.
    pub marker_field: String,
    /// Path probed on the CDP port.
    pub cdp_probe_path: String,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            range_start: 9224,
            range_end: 9240,
            probe_timeout_ms: 500,
            marker_field: "wsEndpoint".to_string(),
            cdp_probe_path: "/json/version".to_string(),
        }
    }
}

impl PortConfig {
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Permission broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PermissionConfig {
    /// Timeout applied when a request does not carry its own budget.
    pub default_timeout_secs: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 5 * 60,
        }
    }
}

impl PermissionConfig {
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl Config {
    /// Reject combinations the scheduler cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.max_concurrent_tasks == 0 {
            return Err(Error::Config(
                "tasks.max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.pool.min_idle > self.pool.max_total {
            return Err(Error::Config(format!(
                "pool.min_idle ({}) exceeds pool.max_total ({})",
                self.pool.min_idle, self.pool.max_total
            )));
        }
        if self.pool.startup_timeout_ms == 0 || self.pool.health_poll_interval_ms == 0 {
            return Err(Error::Config(
                "pool.startup_timeout_ms and pool.health_poll_interval_ms must be positive".into(),
            ));
        }
        // A pair needs two ports, so an empty or single-port range is useless.
        if self.ports.range_start == 0 || self.ports.range_start >= self.ports.range_end {
            return Err(Error::Config(format!(
                "invalid port range {}..={}",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.permissions.default_timeout_secs == 0 {
            return Err(Error::Config(
                "permissions.default_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_values(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = project_config_path(dir);
        if project_path.exists() {
            merge_values(&mut merged, load_config_file(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Project settings file inside `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".agentyard").join("settings.json")
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".agentyard").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/agentyard/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("agentyard").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything else
/// replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        lookup(key).and_then(|v| v.trim().parse().ok())
    }

    if let Some(n) = parsed(&lookup, "AGENTYARD_MAX_CONCURRENT_TASKS") {
        config.tasks.max_concurrent_tasks = n;
    }
    if let Some(n) = parsed(&lookup, "AGENTYARD_POOL_MIN_IDLE") {
        config.pool.min_idle = n;
    }
    if let Some(n) = parsed(&lookup, "AGENTYARD_POOL_MAX_TOTAL") {
        config.pool.max_total = n;
    }
    if let Some(n) = parsed(&lookup, "AGENTYARD_POOL_STARTUP_TIMEOUT_MS") {
        config.pool.startup_timeout_ms = n;
    }
    if let Some(b) = parsed(&lookup, "AGENTYARD_COLD_START_FALLBACK") {
        config.pool.cold_start_fallback = b;
    }
    if let Some(bin) = lookup("AGENTYARD_AGENT_BIN") {
        config.pool.agent_bin = PathBuf::from(bin);
    }
    if let Some(n) = parsed(&lookup, "AGENTYARD_PORT_RANGE_START") {
        config.ports.range_start = n;
    }
    if let Some(n) = parsed(&lookup, "AGENTYARD_PORT_RANGE_END") {
        config.ports.range_end = n;
    }
    if let Some(n) = parsed(&lookup, "AGENTYARD_PERMISSION_TIMEOUT_SECS") {
        config.permissions.default_timeout_secs = n;
    }
}
