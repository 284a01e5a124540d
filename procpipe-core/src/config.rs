//! Launch configuration for a child process.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::error;

/// Callback receiving raw bytes read from one of the child's output streams. It runs on the
/// background reader thread and must not block indefinitely.
pub type OutputCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Callback invoked on the background reader thread when it stops because of an unexpected
/// I/O failure.
pub type ReaderErrorCallback = Box<dyn FnOnce(&error::Error) + Send + 'static>;

/// Default number of bytes read from a pipe per callback invocation.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
/// Default upper bound on how long the background reader idles between drains.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Default delay the synchronous reader waits before polling the pipe.
pub const DEFAULT_READ_LINE_DELAY: Duration = Duration::from_millis(40);
/// Default bound on how long `close` waits for the background reader.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Line terminator appended by [`crate::ProcessInstance::write_command`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LineTerminator {
    /// Carriage return followed by line feed.
    #[default]
    CrLf,
    /// A bare line feed.
    Lf,
}

impl LineTerminator {
    /// Returns the bytes of the terminator.
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::CrLf => b"\r\n",
            Self::Lf => b"\n",
        }
    }
}

/// How long [`crate::ProcessInstance::close`] waits for the background reader to stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseTimeout {
    /// Wait at most the given duration before forcing the process subtree down.
    Bounded(Duration),
    /// Wait until the reader observes the stop request, however long that takes.
    Unbounded,
}

impl Default for CloseTimeout {
    fn default() -> Self {
        Self::Bounded(DEFAULT_CLOSE_TIMEOUT)
    }
}

/// Describes how to launch a child process. Built once and consumed by
/// [`crate::ProcessInstance::spawn`].
#[derive(bon::Builder)]
pub struct ProcessConfig {
    /// Program to execute; looked up in `PATH` when it contains no path separator.
    #[builder(into)]
    pub program: OsString,
    /// Arguments passed to the program.
    #[builder(default)]
    pub args: Vec<OsString>,
    /// Working directory of the child; inherits the caller's when unset.
    #[builder(into)]
    pub current_dir: Option<PathBuf>,
    /// Complete environment of the child. When unset the caller's environment is inherited;
    /// when set it replaces the environment entirely.
    pub environment: Option<Vec<(OsString, OsString)>>,
    /// Invoked with bytes produced on the child's stdout.
    pub on_stdout: Option<OutputCallback>,
    /// Invoked with bytes produced on the child's stderr.
    pub on_stderr: Option<OutputCallback>,
    /// Invoked if the background reader stops on an unexpected failure.
    pub on_reader_error: Option<ReaderErrorCallback>,
    /// Whether to redirect the child's stdout through a pipe.
    #[builder(default = true)]
    pub redirect_stdout: bool,
    /// Whether to redirect the child's stderr through a pipe.
    #[builder(default = true)]
    pub redirect_stderr: bool,
    /// Whether to redirect the child's stdin through a pipe.
    #[builder(default = true)]
    pub redirect_stdin: bool,
    /// Whether to detach the child from the controlling terminal's foreground job by placing
    /// it in its own process group.
    #[builder(default = true)]
    pub hide_window: bool,
    /// Maximum number of bytes delivered per callback invocation.
    #[builder(default = DEFAULT_READ_CHUNK_SIZE)]
    pub read_chunk_size: usize,
    /// Maximum time the background reader idles between drains.
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,
    /// Delay applied by [`crate::ProcessInstance::read_line`] before polling.
    #[builder(default = DEFAULT_READ_LINE_DELAY)]
    pub read_line_delay: Duration,
    /// Bound on how long `close` waits for the background reader.
    #[builder(default)]
    pub close_timeout: CloseTimeout,
    /// Terminator appended by [`crate::ProcessInstance::write_command`].
    #[builder(default)]
    pub line_terminator: LineTerminator,
}

impl ProcessConfig {
    /// Returns whether any of the standard streams is redirected.
    pub const fn redirects_any(&self) -> bool {
        self.redirect_stdin || self.redirect_stdout || self.redirect_stderr
    }

    /// Returns a displayable form of the program name.
    pub fn program_display(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

impl std::fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessConfig")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("current_dir", &self.current_dir)
            .field("environment", &self.environment.as_ref().map(Vec::len))
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .field("redirect_stdout", &self.redirect_stdout)
            .field("redirect_stderr", &self.redirect_stderr)
            .field("redirect_stdin", &self.redirect_stdin)
            .field("hide_window", &self.hide_window)
            .field("read_chunk_size", &self.read_chunk_size)
            .field("poll_interval", &self.poll_interval)
            .field("read_line_delay", &self.read_line_delay)
            .field("close_timeout", &self.close_timeout)
            .field("line_terminator", &self.line_terminator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProcessConfig::builder().program("sh").build();

        assert!(config.redirect_stdout);
        assert!(config.redirect_stderr);
        assert!(config.redirect_stdin);
        assert!(config.hide_window);
        assert!(config.current_dir.is_none());
        assert!(config.environment.is_none());
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.read_line_delay, Duration::from_millis(40));
        assert_eq!(
            config.close_timeout,
            CloseTimeout::Bounded(Duration::from_secs(5))
        );
        assert_eq!(config.line_terminator, LineTerminator::CrLf);
        assert!(config.redirects_any());
    }

    #[test]
    fn redirects_any_is_false_without_redirection() {
        let config = ProcessConfig::builder()
            .program("true")
            .redirect_stdin(false)
            .redirect_stdout(false)
            .redirect_stderr(false)
            .build();

        assert!(!config.redirects_any());
    }

    #[test]
    fn unbounded_close_can_be_requested() {
        let config = ProcessConfig::builder()
            .program("true")
            .close_timeout(CloseTimeout::Unbounded)
            .build();

        assert_eq!(config.close_timeout, CloseTimeout::Unbounded);
    }

    #[test]
    fn terminator_bytes() {
        assert_eq!(LineTerminator::CrLf.as_bytes(), b"\r\n");
        assert_eq!(LineTerminator::Lf.as_bytes(), b"\n");
    }
}
