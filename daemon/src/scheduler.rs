//! Independent fixed-cadence sampling loops, one per telemetry domain.
//!
//! Every loop owns its own collector and ticker. Collection runs on the
//! blocking pool and delivery is detached, so a slow host call or a slow
//! endpoint only ever delays the loop it belongs to.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::collector::{CollectorFactory, MetricsCollector, TOP_N};
use crate::config::IntervalConfig;
use crate::control::{ControlSender, SendError};
use crate::dispatch::{dispatch_detached, Dispatcher, Endpoint};
use crate::model::{HealthReport, Metrics, ProcessInfo, SystemSummary, TopProcess};

/// Control-channel event carrying a mirrored metrics sample.
const METRICS_EVENT: &str = "metric-data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Metrics,
    HealthReport,
    ProcessList,
    TopProcesses,
    SystemSummary,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Metrics,
        Domain::HealthReport,
        Domain::ProcessList,
        Domain::TopProcesses,
        Domain::SystemSummary,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Domain::Metrics => "metrics",
            Domain::HealthReport => "health_report",
            Domain::ProcessList => "process_list",
            Domain::TopProcesses => "top_processes",
            Domain::SystemSummary => "system_summary",
        }
    }

    pub fn period(self, intervals: &IntervalConfig) -> Duration {
        match self {
            Domain::Metrics => intervals.metrics(),
            Domain::HealthReport => intervals.health_report(),
            Domain::ProcessList => intervals.process_list(),
            Domain::TopProcesses => intervals.top_processes(),
            Domain::SystemSummary => intervals.system_summary(),
        }
    }
}

/// Output of one tick of one domain.
enum Sample {
    Metrics(Metrics),
    HealthReport(HealthReport),
    ProcessList(Vec<ProcessInfo>),
    TopProcesses {
        cpu: Vec<TopProcess>,
        memory: Vec<TopProcess>,
    },
    SystemSummary(SystemSummary),
}

fn collect(domain: Domain, collector: &mut dyn MetricsCollector) -> Result<Sample> {
    Ok(match domain {
        Domain::Metrics => Sample::Metrics(collector.metrics()?),
        Domain::HealthReport => Sample::HealthReport(collector.health_report()?),
        Domain::ProcessList => Sample::ProcessList(collector.process_list()?),
        Domain::TopProcesses => Sample::TopProcesses {
            cpu: collector.top_cpu(TOP_N)?,
            memory: collector.top_memory(TOP_N)?,
        },
        Domain::SystemSummary => Sample::SystemSummary(collector.system_summary()?),
    })
}

pub struct Scheduler {
    factory: CollectorFactory,
    dispatcher: Arc<dyn Dispatcher>,
    periods: Vec<(Domain, Duration)>,
    mirror: Option<ControlSender>,
}

impl Scheduler {
    pub fn new(
        factory: CollectorFactory,
        dispatcher: Arc<dyn Dispatcher>,
        intervals: &IntervalConfig,
    ) -> Self {
        Self {
            factory,
            dispatcher,
            periods: Domain::ALL
                .iter()
                .map(|&d| (d, d.period(intervals)))
                .collect(),
            mirror: None,
        }
    }

    /// Also pushes every metrics sample over the control channel.
    pub fn mirror_metrics(mut self, sender: ControlSender) -> Self {
        self.mirror = Some(sender);
        self
    }

    /// Starts one task per domain. Each stops when `token` is cancelled.
    pub fn spawn(self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.periods
            .iter()
            .map(|&(domain, period)| {
                let lane = DomainLoop {
                    domain,
                    period,
                    factory: Arc::clone(&self.factory),
                    dispatcher: Arc::clone(&self.dispatcher),
                    mirror: self.mirror.clone(),
                };
                info!(domain = domain.name(), period = ?period, "sampling loop started");
                tokio::spawn(lane.run(token.clone()))
            })
            .collect()
    }
}

struct DomainLoop {
    domain: Domain,
    period: Duration,
    factory: CollectorFactory,
    dispatcher: Arc<dyn Dispatcher>,
    mirror: Option<ControlSender>,
}

impl DomainLoop {
    async fn run(self, token: CancellationToken) {
        let mut collector: Box<dyn MetricsCollector> = (self.factory)();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let domain = self.domain;
            let joined = tokio::task::spawn_blocking(move || {
                let result = collect(domain, collector.as_mut());
                (collector, result)
            })
            .await;

            let result = match joined {
                Ok((back, result)) => {
                    collector = back;
                    result
                }
                Err(e) => {
                    error!(domain = domain.name(), error = %e, "collector task failed, rebuilding collector");
                    collector = (self.factory)();
                    continue;
                }
            };

            match result {
                Ok(sample) => self.deliver(sample),
                Err(e) => warn!(
                    domain = domain.name(),
                    error = %format!("{e:#}"),
                    "collection failed, skipping tick"
                ),
            }
        }
        debug!(domain = self.domain.name(), "sampling loop stopped");
    }

    fn deliver(&self, sample: Sample) {
        let dispatcher = &self.dispatcher;
        match sample {
            Sample::Metrics(m) => {
                dispatch_detached(dispatcher, Endpoint::Metrics, &m);
                self.mirror_sample(&m);
            }
            Sample::HealthReport(h) => dispatch_detached(dispatcher, Endpoint::HealthReport, &h),
            Sample::ProcessList(list) => dispatch_detached(dispatcher, Endpoint::ProcessList, &list),
            Sample::TopProcesses { cpu, memory } => {
                dispatch_detached(dispatcher, Endpoint::TopCpu, &cpu);
                dispatch_detached(dispatcher, Endpoint::TopMemory, &memory);
            }
            Sample::SystemSummary(s) => dispatch_detached(dispatcher, Endpoint::SystemSummary, &s),
        }
    }

    fn mirror_sample(&self, metrics: &Metrics) {
        let Some(sender) = &self.mirror else {
            return;
        };
        let payload = match serde_json::to_value(metrics) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to encode mirrored metrics");
                return;
            }
        };
        match sender.emit(METRICS_EVENT, &payload) {
            Ok(()) => {}
            Err(SendError::NotJoined) => trace!("control channel not joined, metrics not mirrored"),
            Err(e) => debug!(error = %e, "metrics not mirrored"),
        }
    }
}
