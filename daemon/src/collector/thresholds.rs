//! Classification rules applied to raw samples before they are shipped.

/// Overall metrics status: `critical`, `trouble`, `down` or `up`.
///
/// `down` marks a host that is suspiciously idle on every axis.
pub fn metrics_status(cpu: f64, mem: f64, disk: f64) -> &'static str {
    if cpu > 90.0 || mem > 90.0 || disk > 95.0 {
        "critical"
    } else if cpu > 80.0 || mem > 80.0 || disk > 85.0 {
        "trouble"
    } else if cpu < 5.0 && mem < 10.0 && disk < 10.0 {
        "down"
    } else {
        "up"
    }
}

pub fn partition_health(used_percent: f64) -> &'static str {
    if used_percent > 90.0 {
        "critical"
    } else if used_percent > 80.0 {
        "warning"
    } else {
        "healthy"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Healthy,
    Warning,
    Critical,
}

fn level(value: f64, warn: f64, crit: f64) -> Level {
    if value > crit {
        Level::Critical
    } else if value > warn {
        Level::Warning
    } else {
        Level::Healthy
    }
}

/// Health-report availability. `load` is `(load1, logical_cores)` where the
/// platform reports a load average.
pub fn availability(cpu: f64, mem: f64, disk: f64, load: Option<(f64, usize)>) -> &'static str {
    let mut worst = level(cpu, 70.0, 90.0)
        .max(level(mem, 80.0, 95.0))
        .max(level(disk, 85.0, 95.0));
    if let Some((load1, cores)) = load {
        let cores = cores.max(1) as f64;
        worst = worst.max(level(load1, cores * 1.5, cores * 2.0));
    }
    match worst {
        Level::Healthy => "healthy",
        Level::Warning => "warning",
        Level::Critical => "critical",
    }
}

pub fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// `"{d} day(s) {h} hr(s) {m} min(s) {s} sec(s)"`.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = secs % 86_400 / 3_600;
    let mins = secs % 3_600 / 60;
    let rem = secs % 60;
    format!("{days} day(s) {hours} hr(s) {mins} min(s) {rem} sec(s)")
}

/// Keeps the `n` largest non-zero entries by `key`, descending.
pub fn top_n<T>(mut rows: Vec<T>, n: usize, key: impl Fn(&T) -> f64) -> Vec<T> {
    rows.retain(|r| key(r) > 0.0);
    rows.sort_by(|a, b| key(b).total_cmp(&key(a)));
    rows.truncate(n);
    rows
}
