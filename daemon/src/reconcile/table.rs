use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::model::{DesiredProcess, ProcessStatus};

/// A process the service asked us to watch, with its last probed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchedProcess {
    pub pid: u32,
    pub name: String,
    pub status: ProcessStatus,
}

/// An observed transition worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub pid: u32,
    pub name: String,
    /// Stored status before the transition. During a seed this is the status
    /// the service reported.
    pub previous: ProcessStatus,
    pub status: ProcessStatus,
}

/// Watched processes keyed by pid. Pure state; probing is supplied by the
/// caller so the transition rules can be exercised without a host.
#[derive(Debug, Default)]
pub struct WatchTable {
    entries: BTreeMap<u32, WatchedProcess>,
}

impl WatchTable {
    /// Replaces the whole table with `probed` and returns a correction for
    /// every entry whose reported status disagrees with the probe.
    ///
    /// A pid listed twice keeps its first entry.
    pub fn seed(
        &mut self,
        probed: impl IntoIterator<Item = (DesiredProcess, ProcessStatus)>,
    ) -> Vec<StatusChange> {
        let mut entries = BTreeMap::new();
        let mut changes = Vec::new();
        for (desired, actual) in probed {
            if entries.contains_key(&desired.pid) {
                warn!(pid = desired.pid, name = %desired.name, "duplicate pid in desired set, ignoring");
                continue;
            }
            if desired.reported != actual {
                changes.push(StatusChange {
                    pid: desired.pid,
                    name: desired.name.clone(),
                    previous: desired.reported,
                    status: actual,
                });
            }
            entries.insert(
                desired.pid,
                WatchedProcess {
                    pid: desired.pid,
                    name: desired.name,
                    status: actual,
                },
            );
        }
        self.entries = entries;
        changes
    }

    /// Re-probes every entry, stores new statuses and returns only the
    /// entries that changed.
    pub fn tick(&mut self, mut is_running: impl FnMut(u32, &str) -> bool) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        for entry in self.entries.values_mut() {
            let now = ProcessStatus::from_running(is_running(entry.pid, &entry.name));
            if now != entry.status {
                changes.push(StatusChange {
                    pid: entry.pid,
                    name: entry.name.clone(),
                    previous: entry.status,
                    status: now,
                });
                entry.status = now;
            }
        }
        changes
    }

    pub fn snapshot(&self) -> Vec<WatchedProcess> {
        self.entries.values().cloned().collect()
    }

    /// `(pid, name)` of every entry, in pid order.
    pub fn targets(&self) -> Vec<(u32, String)> {
        self.entries.values().map(|p| (p.pid, p.name.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessStatus::{Down, Up};

    fn desired(pid: u32, name: &str, reported: ProcessStatus) -> DesiredProcess {
        DesiredProcess {
            pid,
            name: name.to_string(),
            reported,
        }
    }

    #[test]
    fn seed_emits_correction_when_probe_disagrees() {
        let mut table = WatchTable::default();
        let changes = table.seed([(desired(10, "svc", Up), Down)]);
        assert_eq!(
            changes,
            vec![StatusChange {
                pid: 10,
                name: "svc".to_string(),
                previous: Up,
                status: Down,
            }]
        );
        assert_eq!(table.snapshot()[0].status, Down);
    }

    #[test]
    fn seed_agreeing_with_probe_is_silent() {
        let mut table = WatchTable::default();
        assert!(table.seed([(desired(1, "a", Up), Up), (desired(2, "b", Down), Down)]).is_empty());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn unknown_reported_status_is_always_corrected() {
        let mut table = WatchTable::default();
        let changes = table.seed([
            (desired(1, "a", ProcessStatus::Unknown), Up),
            (desired(2, "b", ProcessStatus::Unknown), Down),
        ]);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].previous, ProcessStatus::Unknown);
        assert_eq!(changes[0].status, Up);
        assert_eq!(changes[1].status, Down);
    }

    #[test]
    fn reseed_drops_stale_pids() {
        let mut table = WatchTable::default();
        table.seed([(desired(1, "a", Up), Up), (desired(2, "b", Up), Up)]);
        table.seed([(desired(2, "b", Up), Up), (desired(3, "c", Up), Down)]);
        assert_eq!(
            table.targets(),
            vec![(2, "b".to_string()), (3, "c".to_string())]
        );
        assert_eq!(
            table.snapshot(),
            vec![
                WatchedProcess { pid: 2, name: "b".to_string(), status: Up },
                WatchedProcess { pid: 3, name: "c".to_string(), status: Down },
            ]
        );
    }

    #[test]
    fn empty_seed_clears_the_table() {
        let mut table = WatchTable::default();
        table.seed([(desired(1, "a", Up), Up)]);
        table.seed(Vec::new());
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_pid_keeps_first_entry() {
        let mut table = WatchTable::default();
        let changes = table.seed([(desired(5, "first", Up), Up), (desired(5, "second", Down), Up)]);
        assert!(changes.is_empty());
        assert_eq!(table.snapshot(), vec![WatchedProcess { pid: 5, name: "first".to_string(), status: Up }]);
    }

    #[test]
    fn tick_reports_a_transition_once() {
        let mut table = WatchTable::default();
        table.seed([(desired(20, "svc", Up), Up)]);

        let first = table.tick(|_, _| false);
        assert_eq!(first.len(), 1);
        assert_eq!((first[0].pid, first[0].previous, first[0].status), (20, Up, Down));

        assert!(table.tick(|_, _| false).is_empty());
        assert_eq!(table.tick(|_, _| true)[0].status, Up);
    }

    #[test]
    fn tick_passes_stored_names_to_the_probe() {
        let mut table = WatchTable::default();
        table.seed([(desired(7, "db", Down), Down)]);
        let mut seen = Vec::new();
        table.tick(|pid, name| {
            seen.push((pid, name.to_string()));
            false
        });
        assert_eq!(seen, vec![(7, "db".to_string())]);
    }

    #[test]
    fn notification_iff_status_differs_for_any_probe_sequence() {
        let mut table = WatchTable::default();
        table.seed([(desired(1, "p", Up), Up)]);
        let probes = [true, true, false, false, true, false, false, false, true, true];
        let mut stored = Up;
        for running in probes {
            let probed = ProcessStatus::from_running(running);
            let changes = table.tick(|_, _| running);
            assert_eq!(changes.len(), usize::from(probed != stored));
            stored = probed;
        }
    }
}
