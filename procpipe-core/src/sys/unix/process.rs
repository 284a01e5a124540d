//! Process management utilities

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::error;

pub(crate) type ProcessId = i32;

/// Signal used to force processes down. Unix offers no way to choose the exit code of another
/// process, so termination is reported as death by this signal.
pub(crate) const TERMINATION_SIGNAL: Signal = Signal::SIGKILL;

/// Arranges for the command's process to run in its own process group, away from the
/// terminal's foreground job.
pub(crate) fn detach_from_terminal(command: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;

    command.process_group(0);
}

/// Forcibly terminates the given process. A process that no longer exists is not an error.
pub(crate) fn terminate(pid: ProcessId) -> Result<(), Errno> {
    match kill(Pid::from_raw(pid), TERMINATION_SIGNAL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Lists the processes whose parent is `pid`.
#[cfg(target_os = "linux")]
pub(crate) fn child_pids_of(pid: ProcessId) -> Result<Vec<ProcessId>, error::Error> {
    let mut children = vec![];

    // Processes can vanish while we walk the table; skip any entry we can't inspect.
    for process in procfs::process::all_processes()?.flatten() {
        if let Ok(stat) = process.stat() {
            if stat.ppid == pid {
                children.push(stat.pid);
            }
        }
    }

    Ok(children)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn child_pids_of(_pid: ProcessId) -> Result<Vec<ProcessId>, error::Error> {
    Err(error::Error::ErrnoError(Errno::ENOSYS))
}

/// Checks whether the given child of this process has exited, without reaping it. A child
/// that has already been reaped counts as exited.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn has_exited(pid: ProcessId) -> Result<bool, Errno> {
    use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};

    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    match waitid(Id::Pid(Pid::from_raw(pid)), flags) {
        Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Ok(false),
        Ok(_) | Err(Errno::ECHILD) => Ok(true),
        Err(e) => Err(e),
    }
}

//
// nix doesn't expose `waitid` on the remaining unix targets (notably macOS), so go
// straight to libc there.
//

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn has_exited(pid: ProcessId) -> Result<bool, Errno> {
    // SAFETY: `siginfo_t` is plain data; memory is zeroed rather than uninitialized, as not
    // all platforms initialize it when no child has changed state.
    let mut siginfo: nix::libc::siginfo_t = unsafe { std::mem::zeroed() };

    #[allow(clippy::cast_sign_loss)]
    let id = pid as nix::libc::id_t;

    // SAFETY: `siginfo` is a valid, writable `siginfo_t` for the duration of the call.
    let result = unsafe {
        nix::libc::waitid(
            nix::libc::P_PID,
            id,
            &mut siginfo,
            nix::libc::WEXITED | nix::libc::WNOHANG | nix::libc::WNOWAIT,
        )
    };

    match Errno::result(result) {
        // SAFETY: `waitid` succeeded, so `siginfo` was populated (or left zeroed).
        Ok(_) => Ok(unsafe { siginfo.si_pid() } != 0),
        Err(Errno::EINTR) => Ok(false),
        Err(Errno::ECHILD) => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[allow(clippy::cast_possible_wrap)]
    fn pid_of(child: &std::process::Child) -> ProcessId {
        child.id() as ProcessId
    }

    #[test]
    fn running_child_has_not_exited() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        assert!(!has_exited(pid_of(&child)).unwrap());

        terminate(pid_of(&child)).unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn exited_child_is_detected_without_reaping() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = pid_of(&child);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while !has_exited(pid).unwrap() {
            assert!(std::time::Instant::now() < deadline, "child never exited");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        // Still reapable: the query must not have consumed the exit status.
        assert!(child.wait().unwrap().success());
        assert!(has_exited(pid).unwrap());
    }

    #[test]
    fn terminating_a_vanished_process_is_ok() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = pid_of(&child);
        child.wait().unwrap();

        // The pid has been reaped; ESRCH is swallowed.
        assert!(terminate(pid).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lists_direct_children() {
        let me = ProcessId::try_from(std::process::id()).unwrap();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let children = child_pids_of(me).unwrap();
        assert!(children.contains(&pid_of(&child)));

        terminate(pid_of(&child)).unwrap();
        child.wait().unwrap();
    }
}
