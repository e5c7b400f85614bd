//! Host telemetry capability.
//!
//! [`MetricsCollector`] produces one sample per telemetry domain and
//! [`LivenessProbe`] answers "is pid P still the process named N". Both are
//! chosen once at startup for the running [`Platform`].

mod host;
mod probe;
pub mod thresholds;

use anyhow::Result;
use std::sync::Arc;

use crate::identity::Identity;
use crate::model::{HealthReport, Metrics, ProcessInfo, SystemSummary, TopProcess};

pub use host::HostCollector;
pub use probe::SysinfoProbe;

/// Number of rows in the top CPU / top memory lists.
pub const TOP_N: usize = 5;

/// Operating system family the agent is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            "windows" => Platform::Windows,
            _ => Platform::Other,
        }
    }

    /// Process names are case-insensitive on Windows only.
    pub fn names_match(self, a: &str, b: &str) -> bool {
        match self {
            Platform::Windows => a.eq_ignore_ascii_case(b),
            _ => a == b,
        }
    }
}

/// Point-in-time samples for every telemetry domain.
///
/// Implementations keep their own refresh state (CPU usage is a delta between
/// two refreshes), so each sampling loop owns a separate instance.
pub trait MetricsCollector: Send {
    fn metrics(&mut self) -> Result<Metrics>;
    fn health_report(&mut self) -> Result<HealthReport>;
    fn process_list(&mut self) -> Result<Vec<ProcessInfo>>;
    fn top_cpu(&mut self, n: usize) -> Result<Vec<TopProcess>>;
    fn top_memory(&mut self, n: usize) -> Result<Vec<TopProcess>>;
    fn system_summary(&mut self) -> Result<SystemSummary>;
}

/// Liveness check for watched processes.
pub trait LivenessProbe: Send {
    /// Refreshes the probe's view of the given pids.
    fn refresh(&mut self, pids: &[u32]);
    /// True when `pid` is alive *and* its name matches, so a reused pid
    /// belonging to another program reads as down.
    fn is_running(&self, pid: u32, name: &str) -> bool;
}

/// Builds a fresh collector for one sampling loop.
pub type CollectorFactory = Arc<dyn Fn() -> Box<dyn MetricsCollector> + Send + Sync>;

/// Selects the collector implementation for `platform`.
pub fn collector_factory(platform: Platform, identity: Identity) -> CollectorFactory {
    Arc::new(move || Box::new(HostCollector::new(platform, identity.clone())) as Box<dyn MetricsCollector>)
}

/// Selects the liveness probe implementation for `platform`.
pub fn liveness_probe(platform: Platform) -> Box<dyn LivenessProbe> {
    Box::new(SysinfoProbe::new(platform))
}
