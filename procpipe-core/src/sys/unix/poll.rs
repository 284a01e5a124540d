//! Readiness waits on pipe descriptors.

use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// Blocks until at least one of the given descriptors is readable (or hung up), or until
/// `timeout` elapses.
///
/// Returns `Ok(true)` if a descriptor became ready, `Ok(false)` if the timeout elapsed. With no
/// descriptors to watch this simply sleeps for `timeout`.
pub(crate) fn wait_readable(fds: &[BorrowedFd<'_>], timeout: Duration) -> std::io::Result<bool> {
    if fds.is_empty() {
        std::thread::sleep(timeout);
        return Ok(false);
    }

    let mut poll_fds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();

    // Track a deadline so that EINTR retries don't extend the total wait.
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout_ms = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX);
        let poll_timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);

        match poll(&mut poll_fds, poll_timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => (),
            Err(e) => return Err(e.into()),
        }
    }
}
