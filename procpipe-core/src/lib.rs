//! Core of procpipe: launches a single child process with its standard streams redirected
//! through anonymous pipes, streams its output back through callbacks on a background reader,
//! and offers synchronous writes, polled reads and forced termination of the child's process
//! subtree.
//!
//! The crate targets Unix hosts.

#[cfg(not(unix))]
compile_error!("procpipe-core only supports unix targets");

mod config;
pub mod error;
mod handle;
mod launcher;
mod process;
mod reader;
mod sys;
pub mod trace_categories;

pub use config::{
    CloseTimeout, LineTerminator, OutputCallback, ProcessConfig, ReaderErrorCallback,
};
pub use error::Error;
pub use handle::Handle;
pub use process::ProcessInstance;
pub use reader::ReaderExit;

/// Identifies one of the standard streams of a child process.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StdStream {
    /// Standard input.
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl std::fmt::Display for StdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}
