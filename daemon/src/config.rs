use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONTROL_PATH: &str = "/socket.io/";
pub const DEFAULT_CONTROL_QUERY: &str = "EIO=4&transport=websocket";
pub const DEFAULT_NAMESPACE: &str = "/metrics";
pub const DEFAULT_REFRESH_MARKER: &str = "selected-process-refresh";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Deployment environment; selects the collection service endpoint preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    /// Parses `APP_ENV`-style names. An empty name means production.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "test" => Some(Environment::Test),
            "production" | "prod" | "" => Some(Environment::Production),
            _ => None,
        }
    }

    /// Like [`Environment::parse`], falling back to production.
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or(Environment::Production)
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            Environment::Development => "http://localhost:4000",
            Environment::Production => "http://10.1.1.241:5000",
            Environment::Test => "http://localhost:3001/test-api",
        }
    }
}

/// Root configuration structure. Deserialized from `<app dir>/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_environment")]
    pub environment: Environment,
    /// Overrides the environment preset when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            api_endpoint: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Sampling cadence of every telemetry domain, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_metrics_secs")]
    pub metrics_secs: u64,
    #[serde(default = "default_health_report_secs")]
    pub health_report_secs: u64,
    #[serde(default = "default_process_list_secs")]
    pub process_list_secs: u64,
    #[serde(default = "default_top_processes_secs")]
    pub top_processes_secs: u64,
    #[serde(default = "default_system_summary_secs")]
    pub system_summary_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            metrics_secs: default_metrics_secs(),
            health_report_secs: default_health_report_secs(),
            process_list_secs: default_process_list_secs(),
            top_processes_secs: default_top_processes_secs(),
            system_summary_secs: default_system_summary_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_path")]
    pub path: String,
    #[serde(default = "default_control_query")]
    pub query: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Substring identifying a "watched-process-set changed" event.
    #[serde(default = "default_refresh_marker")]
    pub refresh_marker: String,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Also push every metrics sample over the control channel while joined.
    #[serde(default)]
    pub mirror_metrics: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            path: default_control_path(),
            query: default_control_query(),
            namespace: default_namespace(),
            refresh_marker: default_refresh_marker(),
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            mirror_metrics: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Pause between a refresh signal and the re-seed it triggers.
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    /// Pause before the first seed so the control channel can come up.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            settle_delay_secs: default_settle_delay_secs(),
            initial_delay_secs: default_initial_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub json: bool,
    /// Defaults to `<app dir>/logs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: true,
            directory: None,
        }
    }
}

impl Config {
    /// Base URL of the collection service, without a trailing slash.
    pub fn api_base(&self) -> String {
        let raw = self
            .agent
            .api_endpoint
            .as_deref()
            .unwrap_or_else(|| self.agent.environment.default_endpoint());
        raw.trim_end_matches('/').to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.request_timeout_secs.max(1))
    }
}

impl IntervalConfig {
    pub fn metrics(&self) -> Duration {
        secs(self.metrics_secs)
    }

    pub fn health_report(&self) -> Duration {
        secs(self.health_report_secs)
    }

    pub fn process_list(&self) -> Duration {
        secs(self.process_list_secs)
    }

    pub fn top_processes(&self) -> Duration {
        secs(self.top_processes_secs)
    }

    pub fn system_summary(&self) -> Duration {
        secs(self.system_summary_secs)
    }
}

impl ControlConfig {
    pub fn reconnect_delay(&self) -> Duration {
        secs(self.reconnect_delay_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        secs(self.handshake_timeout_secs)
    }
}

impl ReconcileConfig {
    pub fn tick(&self) -> Duration {
        secs(self.tick_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

/// Timer periods of zero are not meaningful; clamp to one second.
fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_environment() -> Environment {
    Environment::from_name(&std::env::var("APP_ENV").unwrap_or_default())
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_metrics_secs() -> u64 {
    10
}

fn default_health_report_secs() -> u64 {
    10
}

fn default_process_list_secs() -> u64 {
    60
}

fn default_top_processes_secs() -> u64 {
    10
}

fn default_system_summary_secs() -> u64 {
    1
}

fn default_control_path() -> String {
    DEFAULT_CONTROL_PATH.to_string()
}

fn default_control_query() -> String {
    DEFAULT_CONTROL_QUERY.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_refresh_marker() -> String {
    DEFAULT_REFRESH_MARKER.to_string()
}

fn default_reconnect_delay() -> u64 {
    DEFAULT_RECONNECT_DELAY_SECS
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

fn default_tick_secs() -> u64 {
    2
}

fn default_settle_delay_secs() -> u64 {
    2
}

fn default_initial_delay_secs() -> u64 {
    3
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn interval_defaults_match_domain_cadence() {
        let i = IntervalConfig::default();
        assert_eq!(i.system_summary(), Duration::from_secs(1));
        assert_eq!(i.metrics(), Duration::from_secs(10));
        assert_eq!(i.health_report(), Duration::from_secs(10));
        assert_eq!(i.top_processes(), Duration::from_secs(10));
        assert_eq!(i.process_list(), Duration::from_secs(60));
    }

    #[test]
    fn control_defaults() {
        let c = ControlConfig::default();
        assert_eq!(c.namespace, DEFAULT_NAMESPACE);
        assert_eq!(c.refresh_marker, DEFAULT_REFRESH_MARKER);
        assert_eq!(c.reconnect_delay(), Duration::from_secs(5));
        assert!(!c.mirror_metrics);
    }

    #[test]
    fn reconcile_defaults() {
        let r = ReconcileConfig::default();
        assert_eq!(r.tick(), Duration::from_secs(2));
        assert_eq!(r.settle_delay(), Duration::from_secs(2));
        assert_eq!(r.initial_delay(), Duration::from_secs(3));
    }

    #[test]
    fn zero_interval_is_clamped_to_one_second() {
        let i = IntervalConfig {
            metrics_secs: 0,
            ..IntervalConfig::default()
        };
        assert_eq!(i.metrics(), Duration::from_secs(1));
    }

    // ── environment ───────────────────────────────────────────────────────────

    #[test]
    fn environment_names_parse() {
        assert_eq!(Environment::from_name("development"), Environment::Development);
        assert_eq!(Environment::from_name(" TEST "), Environment::Test);
        assert_eq!(Environment::from_name(""), Environment::Production);
        assert_eq!(Environment::from_name("staging"), Environment::Production);
        assert_eq!(Environment::parse("staging"), None);
        assert_eq!(Environment::parse("prod"), Some(Environment::Production));
    }

    #[test]
    fn api_base_prefers_explicit_endpoint_and_trims_slash() {
        let mut c = Config::default();
        c.agent.environment = Environment::Development;
        assert_eq!(c.api_base(), "http://localhost:4000");

        c.agent.api_endpoint = Some("https://collector.example.com/".to_string());
        assert_eq!(c.api_base(), "https://collector.example.com");
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config.intervals.process_list_secs, 60);
        assert!(config.agent.api_endpoint.is_none());
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[agent]
environment = "test"
api_endpoint = "http://collector:5000"

[intervals]
system_summary_secs = 5

[control]
reconnect_delay_secs = 1
mirror_metrics = true

[reconcile]
tick_secs = 4
"#,
        )
        .unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.agent.environment, Environment::Test);
        assert_eq!(config.api_base(), "http://collector:5000");
        assert_eq!(config.intervals.system_summary_secs, 5);
        assert_eq!(config.intervals.metrics_secs, 10);
        assert_eq!(config.control.reconnect_delay_secs, 1);
        assert!(config.control.mirror_metrics);
        assert_eq!(config.control.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.reconcile.tick_secs, 4);
        assert_eq!(config.reconcile.settle_delay_secs, 2);
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut original = Config::default();
        original.agent.environment = Environment::Development;
        original.logging.json = false;
        let text = toml::to_string_pretty(&original).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.agent.environment, Environment::Development);
        assert!(!parsed.logging.json);
    }
}
