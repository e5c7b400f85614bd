//! Wire types exchanged with the collection service.
//!
//! Field names follow the service's JSON contract, which mixes snake_case and
//! camelCase; the Rust side stays snake_case and renames per field.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Liveness of a watched process as reported to and by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Up,
    Down,
    /// Any other status string from the service. Never produced by a probe,
    /// so a seeded entry carrying it always gets a correction.
    #[serde(other)]
    Unknown,
}

impl ProcessStatus {
    pub fn from_running(running: bool) -> Self {
        if running {
            ProcessStatus::Up
        } else {
            ProcessStatus::Down
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessStatus::Up => "up",
            ProcessStatus::Down => "down",
            ProcessStatus::Unknown => "unknown",
        })
    }
}

// ── Telemetry samples ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskPartition {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub total: u64,
    pub used: u64,
    pub used_percent: f64,
    /// `healthy`, `warning` or `critical`.
    pub healthy: String,
}

/// Point-in-time system metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub user_id: String,
    pub hostname: String,
    #[serde(rename = "machineId")]
    pub machine_id: String,
    pub cpu_percent: f64,
    pub cpu_per_core: Vec<f64>,
    pub system_idle: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_free: u64,
    pub memory_percent: f64,
    pub swap_memory_used: u64,
    pub swap_memory_total: u64,
    pub swap_memory_free: u64,
    pub swap_mem_usage_percent: f64,
    pub disk_used: u64,
    pub disk_total: u64,
    #[serde(rename = "uptime_seconds")]
    pub uptime: u64,
    pub metric_get_time: String,
    /// `up`, `down`, `trouble` or `critical`.
    pub status: String,
    pub timestamp: i64,
    pub os: String,
    pub disk_partitions: Vec<DiskPartition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub user_id: String,
    #[serde(rename = "machineId")]
    pub machine_id: String,
    pub hostname: String,
    /// `healthy`, `warning` or `critical`.
    pub availability: String,
    #[serde(rename = "cpu")]
    pub cpu_percent: f64,
    #[serde(rename = "memory")]
    pub memory_percent: f64,
    #[serde(rename = "disk")]
    pub disk_percent: f64,
    pub downtimes: u32,
    pub metric_get_time: String,
    #[serde(rename = "sla_achieved")]
    pub sla: String,
}

/// One entry of the full process inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub user_id: String,
    #[serde(rename = "machineId")]
    pub machine_id: String,
    pub hostname: String,
    pub path: String,
    pub pid: u32,
    pub name: String,
    #[serde(rename = "user_name")]
    pub username: String,
    pub cpu_percent: f64,
    pub memory_percent: f32,
    pub thread_count: u32,
    pub handle_count: u32,
    pub timestamp: i64,
}

/// One row of a top-N CPU or memory list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopProcess {
    pub user_id: String,
    #[serde(rename = "machineId")]
    pub machine_id: String,
    pub hostname: String,
    /// The service expects the pid as a string in this payload.
    pub pid: String,
    pub usage: f64,
    pub command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSummary {
    pub user_id: String,
    #[serde(rename = "machineId")]
    pub machine_id: String,
    pub hostname: String,
    pub ip_address: String,
    pub os: String,
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub ram_mb: f64,
    pub disk_count: usize,
    pub uptime: String,
    pub boot_time: u64,
    pub total_processes: usize,
    pub nic_count: usize,
    pub login_count: usize,
    pub current_user: String,
}

// ── Control-plane payloads ────────────────────────────────────────────────────

/// One-shot startup registration body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    #[serde(rename = "monitorId")]
    pub subject_id: String,
    pub hostname: String,
    #[serde(rename = "machineId")]
    pub machine_id: String,
    pub os: String,
}

/// Status-change notification body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessUpdate {
    #[serde(rename = "monitorId")]
    pub subject_id: String,
    pub pid: u32,
    pub name: String,
    pub status: ProcessStatus,
    pub hostname: String,
}

/// One entry of the server-declared desired set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DesiredProcess {
    pub pid: u32,
    pub name: String,
    #[serde(rename = "status")]
    pub reported: ProcessStatus,
}

#[derive(Debug, Deserialize)]
pub struct DesiredSetResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<DesiredSetData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DesiredSetData {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub process: Vec<DesiredProcess>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
