//! Anonymous pipe utilities.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::Handle;

nix::ioctl_read_bad!(fionread, nix::libc::FIONREAD, nix::libc::c_int);

/// What a non-blocking query found on the read end of a pipe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Availability {
    /// The given number of bytes can be read without blocking.
    Bytes(usize),
    /// Nothing is buffered right now, but the write end is still open.
    Empty,
    /// Nothing is buffered and every write end has been closed.
    Closed,
}

/// Creates an anonymous pipe. Both ends are close-on-exec from the moment they exist, so the
/// parent never holds an inheritable copy; only a `dup2` onto a child's standard descriptor
/// makes an end visible to a child.
pub(crate) fn create() -> std::io::Result<(os_pipe::PipeReader, os_pipe::PipeWriter)> {
    os_pipe::pipe()
}

/// Queries how much data can be read from the read end of a pipe without blocking.
pub(crate) fn available(handle: &Handle) -> std::io::Result<Availability> {
    let fd = handle.as_fd().ok_or(Errno::EBADF)?;

    let mut poll_fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let revents = loop {
        match poll(&mut poll_fds, PollTimeout::ZERO) {
            Ok(_) => break poll_fds[0].revents().unwrap_or(PollFlags::empty()),
            Err(Errno::EINTR) => (),
            Err(e) => return Err(e.into()),
        }
    };

    if revents.contains(PollFlags::POLLNVAL) {
        return Err(Errno::EBADF.into());
    }

    let pending = bytes_pending(fd)?;
    if pending > 0 {
        Ok(Availability::Bytes(pending))
    } else if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
        // A pipe with nothing buffered only polls readable once its writers are gone.
        Ok(Availability::Closed)
    } else {
        Ok(Availability::Empty)
    }
}

fn bytes_pending(fd: BorrowedFd<'_>) -> std::io::Result<usize> {
    let mut pending: nix::libc::c_int = 0;

    // SAFETY: `fd` is a live descriptor borrowed for the duration of the call, and FIONREAD
    // writes a single c_int into the provided location.
    unsafe { fionread(fd.as_raw_fd(), &mut pending) }?;

    Ok(usize::try_from(pending).unwrap_or(0))
}
