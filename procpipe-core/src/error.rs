//! Error facilities

use crate::StdStream;

/// Monolithic error type for process management.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An anonymous pipe for the given stream could not be created.
    #[error("failed to create pipe for {0}: {1}")]
    PipeCreationFailed(StdStream, std::io::Error),

    /// A handle could not be duplicated.
    #[error("failed to duplicate handle: {0}")]
    HandleDuplicationFailed(std::io::Error),

    /// An error occurred while creating a child process.
    #[error("failed to create child process '{program}': {source}")]
    ChildCreationFailure {
        /// The program that was being launched.
        program: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The background reader thread could not be started.
    #[error("failed to start reader thread: {0}")]
    ReaderSpawnFailure(std::io::Error),

    /// The requested stream was not redirected, or its handle has been released.
    #[error("{0} is not redirected")]
    StreamNotRedirected(StdStream),

    /// A write to the child's stdin reported zero bytes written.
    #[error("no bytes were written to the child process")]
    NothingWritten,

    /// The process instance has already been closed.
    #[error("process has been closed")]
    ProcessClosed,

    /// The background reader thread panicked.
    #[error("reader thread panicked")]
    ReaderPanicked,

    /// The background reader thread did not stop within the close timeout.
    #[error("reader thread did not stop in time")]
    ReaderTimedOut,

    /// An I/O error occurred.
    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),

    /// A system error occurred.
    #[error("system error: {0}")]
    ErrnoError(#[from] nix::errno::Errno),

    /// An error occurred reading from procfs.
    #[cfg(target_os = "linux")]
    #[error("procfs error: {0}")]
    ProcfsError(#[from] procfs::ProcError),
}
