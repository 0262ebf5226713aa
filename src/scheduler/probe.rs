use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, RefreshKind, System};
use tokio::process::Child;

/// What a single poll of a launched process observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPoll {
    Running,
    Exited(i32),
    /// No exit status and the pid no longer answers the liveness probe.
    Vanished,
    /// The OS reports zombie state but no exit status could be collected.
    Zombie,
}

/// Exit code of a finished process; signal deaths map to the negated signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

/// Signal-0 probe. A pid we may not signal still exists.
pub fn is_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn is_zombie(pid: u32) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new_with_specifics(RefreshKind::nothing());
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(pid)
        .is_some_and(|p| p.status() == ProcessStatus::Zombie)
}

/// Liveness then zombie state for a pid whose exit status is not available.
pub fn pid_status(pid: u32) -> ProcessPoll {
    if !is_alive(pid) {
        ProcessPoll::Vanished
    } else if is_zombie(pid) {
        ProcessPoll::Zombie
    } else {
        ProcessPoll::Running
    }
}

/// Poll `child` without blocking.
///
/// Order: exit status, then liveness, then zombie state. A positive zombie
/// probe re-checks the exit status once, since the process may have exited
/// between the first poll and the probe.
pub fn poll_child(child: &mut Child) -> std::io::Result<ProcessPoll> {
    if let Some(status) = child.try_wait()? {
        return Ok(ProcessPoll::Exited(exit_code(status)));
    }

    let Some(pid) = child.id() else {
        return Ok(ProcessPoll::Vanished);
    };

    match pid_status(pid) {
        ProcessPoll::Zombie => match child.try_wait()? {
            Some(status) => Ok(ProcessPoll::Exited(exit_code(status))),
            None => Ok(ProcessPoll::Zombie),
        },
        poll => Ok(poll),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_from_normal_exit() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        // wait(2) encodes the exit code in the high byte
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[test]
    fn exit_code_from_signal() {
        assert_eq!(exit_code(ExitStatus::from_raw(9)), -9);
        assert_eq!(exit_code(ExitStatus::from_raw(15)), -15);
    }

    #[test]
    fn current_process_is_alive_and_not_zombie() {
        let pid = std::process::id();
        assert!(is_alive(pid));
        assert!(!is_zombie(pid));
    }

    #[test]
    fn reaped_pid_has_vanished() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(!is_alive(pid));
        assert_eq!(pid_status(pid), ProcessPoll::Vanished);
    }

    #[test]
    fn unreaped_exited_child_is_zombie() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        std::thread::sleep(std::time::Duration::from_millis(200));

        assert!(is_alive(pid));
        assert_eq!(pid_status(pid), ProcessPoll::Zombie);
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn poll_running_then_exited() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 0.2; exit 4")
            .spawn()
            .unwrap();

        assert_eq!(poll_child(&mut child).unwrap(), ProcessPoll::Running);

        child.wait().await.unwrap();
        assert_eq!(poll_child(&mut child).unwrap(), ProcessPoll::Exited(4));
    }
}
