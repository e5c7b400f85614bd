//! Keeps the up/down status of the server-declared watch set fresh.
//!
//! [`ProcessReconciler`] is the single owner of the watch table. Seeding,
//! ticking and snapshotting all run on its task, so the periodic tick and a
//! refresh-driven re-seed can never interleave on the same entry. Other tasks
//! see the table only through the published [`WatchSnapshot`].

mod table;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{DesiredSetSource, FetchError, StatusNotifier};
use crate::collector::LivenessProbe;
use crate::config::ReconcileConfig;
use crate::model::{DesiredProcess, ProcessStatus};
use crate::refresh::RefreshReceiver;

pub use table::{StatusChange, WatchTable, WatchedProcess};

/// Read-only view of the reconciler published after every mutation.
#[derive(Debug, Clone, Default)]
pub struct WatchSnapshot {
    pub processes: Vec<WatchedProcess>,
    pub last_seed: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct ProcessReconciler {
    table: WatchTable,
    source: Arc<dyn DesiredSetSource>,
    probe: Arc<Mutex<Box<dyn LivenessProbe>>>,
    notifier: Arc<dyn StatusNotifier>,
    tick: Duration,
    settle_delay: Duration,
    initial_delay: Duration,
    published: watch::Sender<WatchSnapshot>,
}

impl ProcessReconciler {
    pub fn new(
        source: Arc<dyn DesiredSetSource>,
        probe: Box<dyn LivenessProbe>,
        notifier: Arc<dyn StatusNotifier>,
        cfg: &ReconcileConfig,
    ) -> Self {
        let (published, _) = watch::channel(WatchSnapshot::default());
        Self {
            table: WatchTable::default(),
            source,
            probe: Arc::new(Mutex::new(probe)),
            notifier,
            tick: cfg.tick(),
            settle_delay: cfg.settle_delay(),
            initial_delay: cfg.initial_delay(),
            published,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchSnapshot> {
        self.published.subscribe()
    }

    pub fn snapshot(&self) -> Vec<WatchedProcess> {
        self.table.snapshot()
    }

    /// Refreshes the probe for `targets` on the blocking pool and reports,
    /// in order, which of them are running. `None` if the probe panicked.
    async fn probe_all(&self, targets: Vec<(u32, String)>) -> Option<Vec<bool>> {
        let probe = Arc::clone(&self.probe);
        let joined = tokio::task::spawn_blocking(move || {
            let mut probe = probe.lock().unwrap_or_else(PoisonError::into_inner);
            let pids: Vec<u32> = targets.iter().map(|(pid, _)| *pid).collect();
            probe.refresh(&pids);
            targets
                .iter()
                .map(|(pid, name)| probe.is_running(*pid, name))
                .collect::<Vec<bool>>()
        })
        .await;
        match joined {
            Ok(running) => Some(running),
            Err(e) => {
                error!(error = %e, "liveness probe failed");
                None
            }
        }
    }

    /// Probes every desired entry and replaces the table with the result.
    /// Returns corrections for entries the service reported wrongly. If the
    /// probe fails the table is kept and nothing is returned.
    pub async fn seed(&mut self, desired: Vec<DesiredProcess>) -> Vec<StatusChange> {
        let targets = desired.iter().map(|d| (d.pid, d.name.clone())).collect();
        let Some(running) = self.probe_all(targets).await else {
            self.published
                .send_modify(|s| s.last_error = Some("liveness probe failed".to_string()));
            return Vec::new();
        };
        let probed: Vec<(DesiredProcess, ProcessStatus)> = desired
            .into_iter()
            .zip(running)
            .map(|(d, up)| (d, ProcessStatus::from_running(up)))
            .collect();
        let changes = self.table.seed(probed);

        let processes = self.snapshot();
        self.published.send_modify(|s| {
            s.processes = processes;
            s.last_seed = Some(Utc::now());
            s.last_error = None;
        });
        changes
    }

    /// Re-probes the current table. Returns only transitions.
    pub async fn tick(&mut self) -> Vec<StatusChange> {
        if self.table.is_empty() {
            return Vec::new();
        }
        let targets = self.table.targets();
        let pids: Vec<u32> = targets.iter().map(|(pid, _)| *pid).collect();
        let Some(running) = self.probe_all(targets).await else {
            return Vec::new();
        };
        let running: HashMap<u32, bool> = pids.into_iter().zip(running).collect();
        let changes = self
            .table
            .tick(|pid, _| running.get(&pid).copied().unwrap_or(false));
        if !changes.is_empty() {
            let processes = self.snapshot();
            self.published.send_modify(|s| s.processes = processes);
        }
        changes
    }

    /// Fetches the desired set and seeds from it. On failure the table is
    /// left exactly as it was.
    pub async fn reseed(&mut self) -> Result<Vec<StatusChange>, FetchError> {
        match self.source.fetch_desired().await {
            Ok(desired) => Ok(self.seed(desired).await),
            Err(e) => {
                let message = e.to_string();
                self.published.send_modify(|s| s.last_error = Some(message));
                Err(e)
            }
        }
    }

    async fn reseed_and_notify(&mut self) {
        match self.reseed().await {
            Ok(corrections) => {
                info!(
                    watched = self.table.len(),
                    corrections = corrections.len(),
                    "watch set seeded"
                );
                self.notify_detached(corrections);
            }
            Err(e) => warn!(error = %e, "desired-set fetch failed, keeping previous watch set"),
        }
    }

    /// One task per change; notifications are independent and unordered.
    fn notify_detached(&self, changes: Vec<StatusChange>) {
        for change in changes {
            info!(
                pid = change.pid,
                name = %change.name,
                from = %change.previous,
                to = %change.status,
                "process status changed"
            );
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                match notifier.notify(&change).await {
                    Ok(()) => debug!(pid = change.pid, status = %change.status, "status change delivered"),
                    Err(e) => warn!(
                        pid = change.pid,
                        error = %format!("{e:#}"),
                        "status change notification failed"
                    ),
                }
            });
        }
    }

    /// Seeds after the initial delay, then ticks on a fixed interval and
    /// re-seeds after each refresh signal until `token` is cancelled.
    pub async fn run(mut self, mut refresh: RefreshReceiver, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.initial_delay) => {}
        }
        self.reseed_and_notify().await;

        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                signal = refresh.recv(), if refresh_open => {
                    if signal.is_none() {
                        debug!("refresh channel closed, continuing with periodic probing only");
                        refresh_open = false;
                        continue;
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.settle_delay) => {}
                    }
                    info!("refetching watch set");
                    self.reseed_and_notify().await;
                }
                _ = ticker.tick() => {
                    let changes = self.tick().await;
                    self.notify_detached(changes);
                }
            }
        }
        info!("process reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::refresh_channel;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use ProcessStatus::{Down, Up};

    fn desired(pid: u32, name: &str, reported: ProcessStatus) -> DesiredProcess {
        DesiredProcess {
            pid,
            name: name.to_string(),
            reported,
        }
    }

    /// Scripted fetch results; once exhausted, returns `fallback`.
    struct FakeSource {
        script: Mutex<VecDeque<Result<Vec<DesiredProcess>, FetchError>>>,
        fallback: Vec<DesiredProcess>,
        fetches: AtomicUsize,
    }

    impl FakeSource {
        fn new(
            script: Vec<Result<Vec<DesiredProcess>, FetchError>>,
            fallback: Vec<DesiredProcess>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                fetches: AtomicUsize::new(0),
            })
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DesiredSetSource for FakeSource {
        async fn fetch_desired(&self) -> Result<Vec<DesiredProcess>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(result) => result,
                None => Ok(self.fallback.clone()),
            }
        }
    }

    /// Processes "running" on the fake host, by pid.
    #[derive(Clone, Default)]
    struct FakeHost(Arc<Mutex<HashMap<u32, String>>>);

    impl FakeHost {
        fn start(&self, pid: u32, name: &str) {
            self.0.lock().unwrap().insert(pid, name.to_string());
        }

        fn stop(&self, pid: u32) {
            self.0.lock().unwrap().remove(&pid);
        }
    }

    impl LivenessProbe for FakeHost {
        fn refresh(&mut self, _pids: &[u32]) {}

        fn is_running(&self, pid: u32, name: &str) -> bool {
            self.0.lock().unwrap().get(&pid).map(String::as_str) == Some(name)
        }
    }

    struct ChannelNotifier(mpsc::UnboundedSender<StatusChange>);

    #[async_trait]
    impl StatusNotifier for ChannelNotifier {
        async fn notify(&self, change: &StatusChange) -> Result<()> {
            let _ = self.0.send(change.clone());
            Ok(())
        }
    }

    fn reconciler(
        source: Arc<FakeSource>,
        host: &FakeHost,
    ) -> (ProcessReconciler, mpsc::UnboundedReceiver<StatusChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let r = ProcessReconciler::new(
            source,
            Box::new(host.clone()),
            Arc::new(ChannelNotifier(tx)),
            &ReconcileConfig::default(),
        );
        (r, rx)
    }

    #[tokio::test]
    async fn seed_corrects_service_status_from_probe() {
        let host = FakeHost::default();
        let source = FakeSource::new(vec![], vec![desired(10, "svc", Up)]);
        let (mut r, _rx) = reconciler(source, &host);

        let changes = r.reseed().await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!((changes[0].pid, changes[0].status), (10, Down));
        assert_eq!(r.snapshot()[0].status, Down);
    }

    #[tokio::test]
    async fn probe_matches_name_not_just_pid() {
        let host = FakeHost::default();
        host.start(10, "other-program");
        let source = FakeSource::new(vec![], vec![desired(10, "svc", Up)]);
        let (mut r, _rx) = reconciler(source, &host);

        assert_eq!(r.reseed().await.unwrap()[0].status, Down);
    }

    #[tokio::test]
    async fn tick_notifies_once_per_transition() {
        let host = FakeHost::default();
        host.start(20, "svc");
        let source = FakeSource::new(vec![], vec![]);
        let (mut r, _rx) = reconciler(source, &host);
        assert!(r.seed(vec![desired(20, "svc", Up)]).await.is_empty());

        host.stop(20);
        let changes = r.tick().await;
        assert_eq!(changes.len(), 1);
        assert_eq!((changes[0].pid, changes[0].status), (20, Down));
        assert!(r.tick().await.is_empty());
    }

    /// Works until `armed` is set, then panics on refresh.
    struct TrippingProbe {
        host: FakeHost,
        armed: Arc<std::sync::atomic::AtomicBool>,
    }

    impl LivenessProbe for TrippingProbe {
        fn refresh(&mut self, _pids: &[u32]) {
            if self.armed.load(Ordering::SeqCst) {
                panic!("process table unreadable");
            }
        }

        fn is_running(&self, pid: u32, name: &str) -> bool {
            self.host.is_running(pid, name)
        }
    }

    #[tokio::test]
    async fn panicking_probe_keeps_the_table() {
        let host = FakeHost::default();
        host.start(1, "a");
        let armed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut r = ProcessReconciler::new(
            FakeSource::new(vec![], vec![desired(1, "a", Up)]),
            Box::new(TrippingProbe { host: host.clone(), armed: armed.clone() }),
            Arc::new(ChannelNotifier(tx)),
            &ReconcileConfig::default(),
        );
        r.reseed().await.unwrap();

        armed.store(true, Ordering::SeqCst);
        host.stop(1);
        assert!(r.tick().await.is_empty());
        assert!(r.seed(vec![desired(9, "z", Up)]).await.is_empty());
        assert_eq!(r.snapshot(), vec![WatchedProcess { pid: 1, name: "a".to_string(), status: Up }]);
        assert!(r.subscribe().borrow().last_error.is_some());

        // A poisoned lock still yields the probe.
        armed.store(false, Ordering::SeqCst);
        assert_eq!(r.tick().await[0].status, Down);
    }

    #[tokio::test]
    async fn rejected_fetch_keeps_previous_state() {
        let host = FakeHost::default();
        host.start(1, "a");
        let source = FakeSource::new(
            vec![
                Ok(vec![desired(1, "a", Up), desired(2, "b", Down)]),
                Err(FetchError::Rejected("unknown monitor".to_string())),
            ],
            vec![],
        );
        let (mut r, _rx) = reconciler(source, &host);
        let snapshots = r.subscribe();

        r.reseed().await.unwrap();
        let before = r.snapshot();

        assert!(matches!(r.reseed().await, Err(FetchError::Rejected(_))));
        assert_eq!(r.snapshot(), before);
        assert_eq!(snapshots.borrow().processes, before);
        assert!(snapshots.borrow().last_error.is_some());
    }

    #[tokio::test]
    async fn successful_reseed_replaces_everything() {
        let host = FakeHost::default();
        host.start(3, "c");
        let source = FakeSource::new(
            vec![
                Ok(vec![desired(1, "a", Up), desired(2, "b", Up)]),
                Ok(vec![desired(3, "c", Up)]),
            ],
            vec![],
        );
        let (mut r, _rx) = reconciler(source, &host);

        r.reseed().await.unwrap();
        r.reseed().await.unwrap();
        assert_eq!(
            r.snapshot(),
            vec![WatchedProcess { pid: 3, name: "c".to_string(), status: Up }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_seeds_after_initial_delay_and_sends_corrections() {
        let host = FakeHost::default();
        let source = FakeSource::new(vec![], vec![desired(10, "svc", Up)]);
        let (r, mut rx) = reconciler(source.clone(), &host);
        let (_refresh_tx, refresh_rx) = refresh_channel();
        let token = CancellationToken::new();
        let handle = tokio::spawn(r.run(refresh_rx, token.clone()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.fetches(), 0);

        let change = rx.recv().await.unwrap();
        assert_eq!((change.pid, change.status), (10, Down));
        assert_eq!(source.fetches(), 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_a_stopped_process_exactly_once() {
        let host = FakeHost::default();
        host.start(20, "svc");
        let source = FakeSource::new(vec![], vec![desired(20, "svc", Up)]);
        let (r, mut rx) = reconciler(source, &host);
        let (_refresh_tx, refresh_rx) = refresh_channel();
        let token = CancellationToken::new();
        let handle = tokio::spawn(r.run(refresh_rx, token.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        host.stop(20);

        let change = rx.recv().await.unwrap();
        assert_eq!((change.pid, change.previous, change.status), (20, Up, Down));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_refresh_signals_causes_one_reseed() {
        let host = FakeHost::default();
        let source = FakeSource::new(vec![], vec![]);
        let (r, _rx) = reconciler(source.clone(), &host);
        let (refresh_tx, refresh_rx) = refresh_channel();
        let token = CancellationToken::new();
        let handle = tokio::spawn(r.run(refresh_rx, token.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(source.fetches(), 1);

        for _ in 0..5 {
            refresh_tx.post();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.fetches(), 2);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_waits_for_settle_delay() {
        let host = FakeHost::default();
        let source = FakeSource::new(vec![], vec![]);
        let (r, _rx) = reconciler(source.clone(), &host);
        let (refresh_tx, refresh_rx) = refresh_channel();
        let token = CancellationToken::new();
        let handle = tokio::spawn(r.run(refresh_rx, token.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        refresh_tx.post();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.fetches(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.fetches(), 2);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_first_seed_skips_fetch() {
        let host = FakeHost::default();
        let source = FakeSource::new(vec![], vec![]);
        let (r, _rx) = reconciler(source.clone(), &host);
        let (_refresh_tx, refresh_rx) = refresh_channel();
        let token = CancellationToken::new();
        token.cancel();

        r.run(refresh_rx, token).await;
        assert_eq!(source.fetches(), 0);
    }
}
