//! Exclusive ownership of operating-system handles.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::error;

/// An exclusively owned OS handle (a pipe end, on Unix a file descriptor).
///
/// A default-constructed handle is *invalid* and owns nothing. Handles are move-only: there
/// is no implicit copy that would alias the same descriptor. Use [`Handle::duplicate`] to get
/// a second, independently owned descriptor for the same object. Use [`std::mem::take`] to
/// transfer ownership out of a slot, leaving an invalid handle behind.
#[derive(Debug, Default)]
pub struct Handle {
    file: Option<File>,
}

impl Handle {
    /// Returns a handle that owns nothing.
    pub const fn invalid() -> Self {
        Self { file: None }
    }

    /// Returns whether the handle currently owns a descriptor.
    pub const fn is_valid(&self) -> bool {
        self.file.is_some()
    }

    /// Closes the underlying descriptor, if any. Calling this on an invalid handle is a no-op.
    pub fn release(&mut self) {
        // Errors from close(2) are deliberately discarded; the descriptor is gone either way.
        drop(self.file.take());
    }

    /// Gives up ownership of the underlying descriptor without closing it, leaving this handle
    /// invalid. The caller becomes responsible for the returned descriptor.
    pub fn detach(&mut self) -> Option<OwnedFd> {
        self.file.take().map(OwnedFd::from)
    }

    /// Creates a new, independently owned handle referring to the same object. The duplicate
    /// is close-on-exec, so it is never inherited by child processes.
    pub fn duplicate(&self) -> Result<Self, error::Error> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| error::Error::HandleDuplicationFailed(invalid_handle_error()))?;

        let duplicate = file
            .try_clone()
            .map_err(error::Error::HandleDuplicationFailed)?;

        Ok(Self {
            file: Some(duplicate),
        })
    }

    /// Returns the raw descriptor value, if the handle is valid.
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Borrows the underlying descriptor, if the handle is valid.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.file.as_ref().map(AsFd::as_fd)
    }

    fn file(&self) -> std::io::Result<&File> {
        self.file.as_ref().ok_or_else(invalid_handle_error)
    }
}

impl From<OwnedFd> for Handle {
    fn from(fd: OwnedFd) -> Self {
        Self {
            file: Some(File::from(fd)),
        }
    }
}

impl From<os_pipe::PipeReader> for Handle {
    fn from(reader: os_pipe::PipeReader) -> Self {
        Self::from(OwnedFd::from(reader))
    }
}

impl From<os_pipe::PipeWriter> for Handle {
    fn from(writer: os_pipe::PipeWriter) -> Self {
        Self::from(OwnedFd::from(writer))
    }
}

impl std::io::Read for &Handle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = self.file()?;
        file.read(buf)
    }
}

impl std::io::Write for &Handle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file()?;
        file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn invalid_handle_error() -> std::io::Error {
    std::io::Error::from(nix::errno::Errno::EBADF)
}
