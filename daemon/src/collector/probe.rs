use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use super::{LivenessProbe, Platform};

/// Liveness probe backed by the OS process table.
pub struct SysinfoProbe {
    platform: Platform,
    sys: System,
}

impl SysinfoProbe {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            sys: System::new(),
        }
    }
}

impl LivenessProbe for SysinfoProbe {
    fn refresh(&mut self, pids: &[u32]) {
        let pids: Vec<Pid> = pids.iter().copied().map(Pid::from_u32).collect();
        self.sys.refresh_processes(ProcessesToUpdate::Some(&pids), true);
    }

    fn is_running(&self, pid: u32, name: &str) -> bool {
        let Some(process) = self.sys.process(Pid::from_u32(pid)) else {
            return false;
        };
        // Exited but not yet reaped by its parent.
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return false;
        }
        // The kernel may truncate the short name; the executable's file name
        // is the second chance.
        let short = process.name().to_string_lossy();
        if self.platform.names_match(&short, name) {
            return true;
        }
        process
            .exe()
            .and_then(|exe| exe.file_name())
            .map(|file| self.platform.names_match(&file.to_string_lossy(), name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_running_under_its_own_name() {
        let platform = Platform::current();
        let pid = std::process::id();
        let mut probe = SysinfoProbe::new(platform);
        probe.refresh(&[pid]);

        let own_name = probe
            .sys
            .process(Pid::from_u32(pid))
            .map(|p| p.name().to_string_lossy().into_owned())
            .expect("own process visible");
        assert!(probe.is_running(pid, &own_name));
    }

    #[test]
    fn live_pid_with_wrong_name_is_down() {
        let pid = std::process::id();
        let mut probe = SysinfoProbe::new(Platform::current());
        probe.refresh(&[pid]);
        assert!(!probe.is_running(pid, "definitely-not-this-binary"));
    }

    #[cfg(unix)]
    #[test]
    fn killed_but_unreaped_child_is_down() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let mut probe = SysinfoProbe::new(Platform::current());
        probe.refresh(&[pid]);
        assert!(probe.is_running(pid, "sleep"));

        child.kill().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        probe.refresh(&[pid]);
        assert!(!probe.is_running(pid, "sleep"));

        child.wait().unwrap();
    }

    #[test]
    fn unrefreshed_pid_is_down() {
        let probe = SysinfoProbe::new(Platform::current());
        assert!(!probe.is_running(std::process::id(), "anything"));
    }
}
