//! Process liveness probing.

use bbque_core::Pid;

/// Tells whether a process still exists.
pub trait ProcessLiveness: Send + Sync {
    fn is_alive(&self, pid: Pid) -> bool;
}

/// Probes with signal 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalLiveness;

impl ProcessLiveness for SignalLiveness {
    fn is_alive(&self, pid: Pid) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs the permission and existence checks only.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// Treats every process as alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeAlive;

impl ProcessLiveness for AssumeAlive {
    fn is_alive(&self, _pid: Pid) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(SignalLiveness.is_alive(std::process::id()));
    }

    #[test]
    fn invalid_pids_are_dead() {
        assert!(!SignalLiveness.is_alive(0));
        assert!(!SignalLiveness.is_alive(u32::MAX));
    }
}
