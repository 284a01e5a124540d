//! The running child process and its lifecycle.

use std::io::{Read, Write};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CloseTimeout, LineTerminator, OutputCallback, ReaderErrorCallback};
use crate::reader::{ReaderExit, ReaderSignals, ReaderTask, StreamingReader};
use crate::sys::pipes::Availability;
use crate::sys::process::ProcessId;
use crate::{Handle, ProcessConfig, StdStream, error, launcher, sys, trace_categories};

/// A launched child process with (optionally) redirected standard streams.
///
/// Output of redirected streams with a configured callback is delivered on a background
/// reader thread. Commands are written to the child's stdin with [`Self::write`] or
/// [`Self::write_command`], and short request/response exchanges can use
/// [`Self::read_line`]. [`Self::close`] stops the reader and releases all pipe handles; it is
/// also invoked on drop. [`Self::kill`] forcibly terminates the child and its direct children.
///
/// Lifecycle calls (`close`, `kill`) are not meant to race each other from multiple threads.
pub struct ProcessInstance {
    program: String,
    child: std::process::Child,
    pid: ProcessId,
    stdin: Handle,
    stdout: Handle,
    stderr: Handle,
    signals: Arc<ReaderSignals>,
    reader: Option<ReaderTask>,
    reader_outcome: Option<Result<ReaderExit, error::Error>>,
    exit_status: Option<ExitStatus>,
    closed: bool,
    read_line_delay: Duration,
    close_timeout: CloseTimeout,
    line_terminator: LineTerminator,
}

impl ProcessInstance {
    /// Launches the child described by `config`, and starts the background reader if at least
    /// one output stream is redirected and has a callback.
    ///
    /// # Arguments
    ///
    /// * `config` - Launch configuration; consumed.
    pub fn spawn(config: ProcessConfig) -> Result<Self, error::Error> {
        let launched = launcher::launch(&config)?;

        let signals = Arc::new(ReaderSignals::new(launched.pid));

        let mut instance = Self {
            program: config.program_display(),
            child: launched.child,
            pid: launched.pid,
            stdin: launched.stdin,
            stdout: launched.stdout,
            stderr: launched.stderr,
            signals,
            reader: None,
            reader_outcome: None,
            exit_status: None,
            closed: false,
            read_line_delay: config.read_line_delay,
            close_timeout: config.close_timeout,
            line_terminator: config.line_terminator,
        };

        if config.redirect_stdout || config.redirect_stderr {
            let callbacks = ReaderCallbacks {
                on_stdout: config.on_stdout,
                on_stderr: config.on_stderr,
                on_error: config.on_reader_error,
            };

            if let Err(e) =
                instance.start_reader(callbacks, config.read_chunk_size, config.poll_interval)
            {
                tracing::error!(target: trace_categories::LAUNCH, op = "start_reader", "failed to start reader for '{}': {e}", instance.program);

                // Without a reader the instance is unusable; don't leave the child behind.
                if let Err(kill_error) = instance.terminate_subtree() {
                    tracing::warn!(target: trace_categories::LIFECYCLE, op = "kill", "failed to terminate pid {}: {kill_error}", instance.pid);
                }
                let _ = instance.child.wait();
                return Err(e);
            }
        }

        Ok(instance)
    }

    fn start_reader(
        &mut self,
        callbacks: ReaderCallbacks,
        read_chunk_size: usize,
        poll_interval: Duration,
    ) -> Result<(), error::Error> {
        let mut reader =
            StreamingReader::new(read_chunk_size, poll_interval, Arc::clone(&self.signals));

        // The reader works on its own duplicates so that releasing our handles never pulls a
        // descriptor out from under it.
        if let Some(callback) = callbacks.on_stdout {
            if self.stdout.is_valid() {
                reader.add_stream(StdStream::Stdout, self.stdout.duplicate()?, callback);
            }
        }
        if let Some(callback) = callbacks.on_stderr {
            if self.stderr.is_valid() {
                reader.add_stream(StdStream::Stderr, self.stderr.duplicate()?, callback);
            }
        }

        if !reader.has_streams() {
            return Ok(());
        }

        self.reader = Some(ReaderTask::spawn(reader, callbacks.on_error, self.pid)?);
        Ok(())
    }

    /// Returns the OS-assigned process identifier of the child.
    #[allow(clippy::cast_sign_loss)]
    pub const fn id(&self) -> u32 {
        self.pid as u32
    }

    /// Returns whether [`Self::close`] has been called.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns whether a background reader thread is still running.
    pub fn is_reader_running(&self) -> bool {
        self.reader.as_ref().is_some_and(|reader| !reader.is_finished())
    }

    /// Returns how the background reader ended, once [`Self::close`] has collected it. `None`
    /// if no reader was started or it has not been collected yet.
    pub const fn reader_outcome(&self) -> Option<&Result<ReaderExit, error::Error>> {
        self.reader_outcome.as_ref()
    }

    /// Writes raw bytes to the child's stdin.
    ///
    /// Returns the number of bytes written; a write that reports zero bytes is an error.
    ///
    /// # Arguments
    ///
    /// * `bytes` - The bytes to send.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, error::Error> {
        if self.closed {
            return Err(error::Error::ProcessClosed);
        }
        if !self.stdin.is_valid() {
            return Err(error::Error::StreamNotRedirected(StdStream::Stdin));
        }

        let written = (&self.stdin).write(bytes).inspect_err(|e| {
            tracing::error!(target: trace_categories::LIFECYCLE, op = "write", "failed to write to pid {}: {e}", self.pid);
        })?;

        if written == 0 {
            tracing::warn!(target: trace_categories::LIFECYCLE, op = "write", "no bytes written to pid {}", self.pid);
            return Err(error::Error::NothingWritten);
        }

        Ok(written)
    }

    /// Writes a command line to the child's stdin, always appending exactly one line
    /// terminator (even if `command` already ends with one). Short writes are retried until
    /// the whole line is sent.
    ///
    /// # Arguments
    ///
    /// * `command` - The command text, without terminator.
    pub fn write_command(&self, command: &str) -> Result<(), error::Error> {
        let terminator = self.line_terminator.as_bytes();

        let mut line = Vec::with_capacity(command.len() + terminator.len());
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(terminator);

        let mut remaining = line.as_slice();
        while !remaining.is_empty() {
            let written = self.write(remaining)?;
            remaining = remaining.get(written..).unwrap_or_default();
        }

        Ok(())
    }

    /// Reads whatever is currently buffered on the child's stdout without blocking. Returns an
    /// empty buffer if nothing is available or the pipe has closed.
    pub fn read_available(&self) -> Result<Vec<u8>, error::Error> {
        if self.closed {
            return Err(error::Error::ProcessClosed);
        }
        if !self.stdout.is_valid() {
            return Err(error::Error::StreamNotRedirected(StdStream::Stdout));
        }

        match sys::pipes::available(&self.stdout)? {
            Availability::Bytes(count) => {
                let mut buffer = vec![0; count];
                (&self.stdout).read_exact(&mut buffer)?;
                Ok(buffer)
            }
            Availability::Empty | Availability::Closed => Ok(vec![]),
        }
    }

    /// Waits briefly for output to accumulate, then returns whatever is buffered on the
    /// child's stdout as text. Returns an empty string if nothing is available or on failure.
    ///
    /// Meant for simple command/response exchanges where the caller controls pacing. Don't
    /// combine it with a stdout callback: both would consume the same pipe.
    pub fn read_line(&self) -> String {
        std::thread::sleep(self.read_line_delay);

        match self.read_available() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::error!(target: trace_categories::READER, op = "read_line", "failed to read from pid {}: {e}", self.pid);
                String::new()
            }
        }
    }

    /// Closes the child's stdin so that it observes end-of-input. Output keeps streaming.
    pub fn close_stdin(&mut self) {
        self.stdin.release();
    }

    /// Stops the background reader and releases all pipe handles. Idempotent.
    ///
    /// The reader is asked to stop and then awaited. With a bounded close timeout, a reader
    /// that has not stopped in time causes the process subtree to be terminated; if it still
    /// doesn't stop, it is detached and [`Self::reader_outcome`] reports
    /// [`error::Error::ReaderTimedOut`].
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.signals.request_stop();

        if let Some(reader) = self.reader.take() {
            let outcome = self.stop_reader(reader);
            self.reader_outcome = Some(outcome);
        }

        self.stdin.release();
        self.stdout.release();
        self.stderr.release();

        tracing::debug!(target: trace_categories::LIFECYCLE, "closed pid {}", self.pid);
    }

    fn stop_reader(&self, reader: ReaderTask) -> Result<ReaderExit, error::Error> {
        let CloseTimeout::Bounded(timeout) = self.close_timeout else {
            return reader.join();
        };

        if reader.wait(timeout) {
            return reader.join();
        }

        tracing::warn!(target: trace_categories::LIFECYCLE, op = "close", "reader for pid {} did not stop within {timeout:?}; terminating process", self.pid);
        if let Err(e) = self.terminate_subtree() {
            tracing::warn!(target: trace_categories::LIFECYCLE, op = "close", "failed to terminate pid {}: {e}", self.pid);
        }

        if reader.wait(timeout) {
            return reader.join();
        }

        tracing::error!(target: trace_categories::LIFECYCLE, op = "close", "reader for pid {} is still running; detaching it", self.pid);
        Err(error::Error::ReaderTimedOut)
    }

    /// Forcibly terminates the child and every process whose parent is the child.
    ///
    /// A no-op if the instance is closed or the child has already been reaped. If the process
    /// table can't be enumerated, only the child itself is terminated. Descendants more than
    /// one level down are not tracked.
    pub fn kill(&self) -> Result<(), error::Error> {
        if self.pid == 0 || self.closed || self.exit_status.is_some() {
            return Ok(());
        }

        self.terminate_subtree()
    }

    fn terminate_subtree(&self) -> Result<(), error::Error> {
        match sys::process::child_pids_of(self.pid) {
            Ok(children) => {
                for child in children {
                    tracing::debug!(target: trace_categories::LIFECYCLE, "terminating pid {child} (child of {})", self.pid);
                    if let Err(e) = sys::process::terminate(child) {
                        tracing::warn!(target: trace_categories::LIFECYCLE, op = "kill", "failed to terminate pid {child}: {e}");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(target: trace_categories::LIFECYCLE, op = "kill", "cannot enumerate children of pid {} ({e}); terminating it alone", self.pid);
            }
        }

        sys::process::terminate(self.pid).inspect_err(|e| {
            tracing::error!(target: trace_categories::LIFECYCLE, op = "kill", "failed to terminate pid {}: {e}", self.pid);
        })?;

        Ok(())
    }

    /// Returns the child's exit status if it has exited, without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, error::Error> {
        if self.exit_status.is_none() {
            if let Some(status) = self.child.try_wait()? {
                self.record_exit(status);
            }
        }

        Ok(self.exit_status)
    }

    /// Blocks until the child exits and returns its exit status.
    ///
    /// Unlike [`std::process::Child::wait`], stdin is left open; a child waiting for input
    /// needs [`Self::close_stdin`] first.
    pub fn wait(&mut self) -> Result<ExitStatus, error::Error> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        let status = self.child.wait()?;
        self.record_exit(status);
        Ok(status)
    }

    fn record_exit(&mut self, status: ExitStatus) {
        tracing::debug!(target: trace_categories::LIFECYCLE, "pid {} exited: {status}", self.pid);
        self.exit_status = Some(status);
        self.signals.invalidate_pid();
    }
}

impl Drop for ProcessInstance {
    fn drop(&mut self) {
        self.close();

        // Reap the child if it's already gone.
        let _ = self.try_wait();
    }
}

impl std::fmt::Debug for ProcessInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessInstance")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("closed", &self.closed)
            .field("exit_status", &self.exit_status)
            .finish_non_exhaustive()
    }
}

struct ReaderCallbacks {
    on_stdout: Option<OutputCallback>,
    on_stderr: Option<OutputCallback>,
    on_error: Option<ReaderErrorCallback>,
}
