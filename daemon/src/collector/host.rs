use anyhow::{ensure, Result};
use chrono::{Local, Utc};
use std::collections::HashSet;
use std::net::UdpSocket;
use sysinfo::{
    CpuRefreshKind, Disks, MemoryRefreshKind, Networks, Process, ProcessRefreshKind,
    ProcessesToUpdate, RefreshKind, System, UpdateKind, Users,
};

use super::thresholds::{
    availability, format_uptime, metrics_status, partition_health, percent, top_n,
};
use super::{MetricsCollector, Platform};
use crate::identity::Identity;
use crate::model::{DiskPartition, HealthReport, Metrics, ProcessInfo, SystemSummary, TopProcess};

const LOCAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const SLA_TARGET: &str = "99.9";

/// Collector backed by `sysinfo`, with per-platform details chosen by
/// [`Platform`].
pub struct HostCollector {
    platform: Platform,
    identity: Identity,
    sys: System,
}

impl HostCollector {
    pub fn new(platform: Platform, identity: Identity) -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            platform,
            identity,
            sys,
        }
    }

    fn refresh_cpu_and_memory(&mut self) -> Result<()> {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        ensure!(!self.sys.cpus().is_empty(), "no CPU information available");
        Ok(())
    }

    fn refresh_processes(&mut self, kind: ProcessRefreshKind) {
        self.sys
            .refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
    }

    fn top_process(&self, process: &Process, usage: f64) -> TopProcess {
        TopProcess {
            user_id: self.identity.subject_id.clone(),
            machine_id: self.identity.machine_id.clone(),
            hostname: self.identity.hostname.clone(),
            pid: process.pid().as_u32().to_string(),
            usage,
            command: process.name().to_string_lossy().into_owned(),
        }
    }

    /// Open handle count. Only Linux exposes this cheaply (`/proc/<pid>/fd`).
    fn handle_count(&self, pid: u32) -> u32 {
        match self.platform {
            Platform::Linux => std::fs::read_dir(format!("/proc/{pid}/fd"))
                .map(|dir| dir.count() as u32)
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Load average is meaningless on Windows, where sysinfo reports zeros.
    fn load(&self) -> Option<(f64, usize)> {
        match self.platform {
            Platform::Windows => None,
            _ => Some((System::load_average().one, self.sys.cpus().len())),
        }
    }

    fn current_user(&self) -> String {
        let key = match self.platform {
            Platform::Windows => "USERNAME",
            _ => "USER",
        };
        std::env::var(key).unwrap_or_default()
    }
}

impl MetricsCollector for HostCollector {
    fn metrics(&mut self) -> Result<Metrics> {
        self.refresh_cpu_and_memory()?;

        let cpu_percent = self.sys.global_cpu_usage() as f64;
        let cpu_per_core = self.sys.cpus().iter().map(|c| c.cpu_usage() as f64).collect();
        let memory_total = self.sys.total_memory();
        let memory_used = self.sys.used_memory();
        let memory_percent = percent(memory_used, memory_total);
        let swap_total = self.sys.total_swap();
        let swap_used = self.sys.used_swap();

        let partitions = disk_partitions();
        let disk_total: u64 = partitions.iter().map(|p| p.total).sum();
        let disk_used: u64 = partitions.iter().map(|p| p.used).sum();
        let disk_percent = percent(disk_used, disk_total);
        let now = Utc::now();

        Ok(Metrics {
            user_id: self.identity.subject_id.clone(),
            hostname: self.identity.hostname.clone(),
            machine_id: self.identity.machine_id.clone(),
            cpu_percent,
            cpu_per_core,
            system_idle: (100.0 - cpu_percent).max(0.0),
            memory_used,
            memory_total,
            memory_free: self.sys.available_memory(),
            memory_percent,
            swap_memory_used: swap_used,
            swap_memory_total: swap_total,
            swap_memory_free: self.sys.free_swap(),
            swap_mem_usage_percent: percent(swap_used, swap_total),
            disk_used,
            disk_total,
            uptime: System::uptime(),
            metric_get_time: now.to_rfc3339(),
            status: metrics_status(cpu_percent, memory_percent, disk_percent).to_string(),
            timestamp: now.timestamp(),
            os: self.identity.os.clone(),
            disk_partitions: partitions,
        })
    }

    fn health_report(&mut self) -> Result<HealthReport> {
        self.refresh_cpu_and_memory()?;

        let cpu = self.sys.global_cpu_usage() as f64;
        let mem = percent(self.sys.used_memory(), self.sys.total_memory());
        let partitions = disk_partitions();
        let disk = partitions
            .iter()
            .find(|p| p.mountpoint == "/" || p.mountpoint.eq_ignore_ascii_case("C:\\"))
            .or_else(|| partitions.first())
            .map(|p| p.used_percent)
            .unwrap_or(0.0);

        Ok(HealthReport {
            user_id: self.identity.subject_id.clone(),
            machine_id: self.identity.machine_id.clone(),
            hostname: self.identity.hostname.clone(),
            availability: availability(cpu, mem, disk, self.load()).to_string(),
            cpu_percent: cpu,
            memory_percent: mem,
            disk_percent: disk,
            downtimes: 0,
            metric_get_time: Local::now().format(LOCAL_TIME_FORMAT).to_string(),
            sla: SLA_TARGET.to_string(),
        })
    }

    fn process_list(&mut self) -> Result<Vec<ProcessInfo>> {
        self.refresh_cpu_and_memory()?;
        self.refresh_processes(ProcessRefreshKind::everything());

        let users = Users::new_with_refreshed_list();
        let total_memory = self.sys.total_memory();
        let timestamp = Utc::now().timestamp();

        let list = self
            .sys
            .processes()
            .values()
            .map(|p| {
                let pid = p.pid().as_u32();
                ProcessInfo {
                    user_id: self.identity.subject_id.clone(),
                    machine_id: self.identity.machine_id.clone(),
                    hostname: self.identity.hostname.clone(),
                    path: p.exe().map(|e| e.display().to_string()).unwrap_or_default(),
                    pid,
                    name: p.name().to_string_lossy().into_owned(),
                    username: p
                        .user_id()
                        .and_then(|uid| users.get_user_by_id(uid))
                        .map(|u| u.name().to_string())
                        .unwrap_or_default(),
                    cpu_percent: p.cpu_usage() as f64,
                    memory_percent: percent(p.memory(), total_memory) as f32,
                    thread_count: p.tasks().map(|t| t.len() as u32).unwrap_or(1),
                    handle_count: self.handle_count(pid),
                    timestamp,
                }
            })
            .collect();
        Ok(list)
    }

    fn top_cpu(&mut self, n: usize) -> Result<Vec<TopProcess>> {
        self.refresh_processes(ProcessRefreshKind::new().with_cpu());
        let rows: Vec<TopProcess> = self
            .sys
            .processes()
            .values()
            .map(|p| self.top_process(p, p.cpu_usage() as f64))
            .collect();
        Ok(top_n(rows, n, |r| r.usage))
    }

    fn top_memory(&mut self, n: usize) -> Result<Vec<TopProcess>> {
        self.sys.refresh_memory();
        self.refresh_processes(ProcessRefreshKind::new().with_memory());
        let total = self.sys.total_memory();
        let rows: Vec<TopProcess> = self
            .sys
            .processes()
            .values()
            .map(|p| self.top_process(p, percent(p.memory(), total)))
            .collect();
        Ok(top_n(rows, n, |r| r.usage))
    }

    fn system_summary(&mut self) -> Result<SystemSummary> {
        self.refresh_cpu_and_memory()?;
        self.refresh_processes(ProcessRefreshKind::new().with_user(UpdateKind::OnlyIfNotSet));

        let cpu_model = self
            .sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_default();
        let login_count = self
            .sys
            .processes()
            .values()
            .filter_map(|p| p.user_id().cloned())
            .collect::<HashSet<_>>()
            .len();
        let os = format!(
            "{} {} ({})",
            System::name().unwrap_or_else(|| self.identity.os.clone()),
            System::os_version().unwrap_or_default(),
            std::env::consts::ARCH
        );

        Ok(SystemSummary {
            user_id: self.identity.subject_id.clone(),
            machine_id: self.identity.machine_id.clone(),
            hostname: self.identity.hostname.clone(),
            ip_address: outbound_ip().unwrap_or_default(),
            os,
            cpu_model,
            cpu_cores: self.sys.cpus().len(),
            ram_mb: self.sys.total_memory() as f64 / (1024.0 * 1024.0),
            disk_count: Disks::new_with_refreshed_list().list().len(),
            uptime: format_uptime(System::uptime()),
            boot_time: System::boot_time(),
            total_processes: self.sys.processes().len(),
            nic_count: Networks::new_with_refreshed_list().list().len(),
            login_count,
            current_user: self.current_user(),
        })
    }
}

fn disk_partitions() -> Vec<DiskPartition> {
    Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|d| {
            let total = d.total_space();
            let used = total.saturating_sub(d.available_space());
            let used_percent = percent(used, total);
            DiskPartition {
                device: d.name().to_string_lossy().into_owned(),
                mountpoint: d.mount_point().display().to_string(),
                fstype: d.file_system().to_string_lossy().into_owned(),
                total,
                used,
                used_percent,
                healthy: partition_health(used_percent).to_string(),
            }
        })
        .collect()
}

/// Local address of the default route. Connecting a UDP socket sends nothing.
fn outbound_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}
