//! Background streaming of a child's output to callbacks.

use std::convert::Infallible;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{OutputCallback, ReaderErrorCallback};
use crate::sys::pipes::Availability;
use crate::sys::process::ProcessId;
use crate::{Handle, StdStream, error, sys, trace_categories};

/// Number of bytes a regular drain delivers before giving the loop a chance to observe a
/// stop request.
const DRAIN_BUDGET: usize = 64 * 1024;
/// Number of bytes the final drain after child exit may deliver. At least a full pipe buffer,
/// so that everything the child itself wrote is picked up whatever the chunk size.
const FLUSH_BUDGET: usize = 16 * 1024 * 1024;

/// Why the background reader stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReaderExit {
    /// Every drained pipe was closed by the child side.
    PipesClosed,
    /// A stop was requested by `close`.
    Stopped,
    /// The child process exited; buffered output was flushed one last time.
    ChildExited,
}

/// State shared between a process instance and its background reader. Only atomics; there
/// are no locks between the two.
#[derive(Debug)]
pub(crate) struct ReaderSignals {
    stop: AtomicBool,
    pid: AtomicI32,
}

impl ReaderSignals {
    pub(crate) const fn new(pid: ProcessId) -> Self {
        Self {
            stop: AtomicBool::new(false),
            pid: AtomicI32::new(pid),
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Returns the child's pid while it is still considered alive.
    pub(crate) fn pid(&self) -> Option<ProcessId> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Marks the child's process handle as no longer valid.
    pub(crate) fn invalidate_pid(&self) {
        self.pid.store(0, Ordering::Release);
    }
}

/// Outcome of one drain attempt over all active streams.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DrainStatus {
    /// Every open stream is empty.
    Idle,
    /// The budget ran out; more may be waiting.
    Progress,
    /// Every stream has been closed.
    Closed,
}

struct ReaderStream {
    kind: StdStream,
    handle: Handle,
    callback: OutputCallback,
    open: bool,
}

/// Drains redirected output pipes and hands their bytes to callbacks.
pub(crate) struct StreamingReader {
    streams: Vec<ReaderStream>,
    buffer: Vec<u8>,
    poll_interval: Duration,
    signals: Arc<ReaderSignals>,
}

impl StreamingReader {
    pub(crate) fn new(
        read_chunk_size: usize,
        poll_interval: Duration,
        signals: Arc<ReaderSignals>,
    ) -> Self {
        Self {
            streams: vec![],
            buffer: vec![0; read_chunk_size.max(1)],
            poll_interval,
            signals,
        }
    }

    /// Adds a stream to drain. `handle` must be the reader's own handle to the pipe's read end.
    pub(crate) fn add_stream(&mut self, kind: StdStream, handle: Handle, callback: OutputCallback) {
        self.streams.push(ReaderStream {
            kind,
            handle,
            callback,
            open: true,
        });
    }

    pub(crate) fn has_streams(&self) -> bool {
        !self.streams.is_empty()
    }

    /// Runs the reader until its pipes close, a stop is requested, or the child exits.
    pub(crate) fn run(mut self) -> Result<ReaderExit, error::Error> {
        loop {
            let status = self.drain(DRAIN_BUDGET)?;
            if status == DrainStatus::Closed {
                return Ok(ReaderExit::PipesClosed);
            }

            if self.signals.stop_requested() {
                return Ok(ReaderExit::Stopped);
            }

            // Child exit only matters once the pipes are empty.
            if status != DrainStatus::Idle {
                continue;
            }

            if self.child_has_exited()? {
                self.signals.invalidate_pid();
                self.flush();
                return Ok(ReaderExit::ChildExited);
            }

            self.wait_for_data()?;
        }
    }

    /// Picks up whatever the exited child left in the pipes. Writers that outlive the child
    /// (its own children, say) are cut off after `FLUSH_BUDGET` bytes.
    fn flush(&mut self) {
        match self.drain(FLUSH_BUDGET) {
            Ok(DrainStatus::Progress) => {
                tracing::warn!(target: trace_categories::READER, op = "flush", "output still arriving after child exit; discarding the rest");
            }
            Ok(DrainStatus::Idle | DrainStatus::Closed) => (),
            Err(e) => {
                tracing::warn!(target: trace_categories::READER, op = "flush", "final drain failed: {e}");
            }
        }
    }

    /// Reads whatever is currently available on the open streams, visiting every stream on
    /// each pass. Stops after a pass that found nothing, or once `budget` bytes were delivered.
    fn drain(&mut self, budget: usize) -> Result<DrainStatus, error::Error> {
        let mut delivered = 0;

        loop {
            let mut found_data = false;

            for stream in self.streams.iter_mut().filter(|s| s.open) {
                match sys::pipes::available(&stream.handle)? {
                    Availability::Bytes(count) => {
                        let len = count.min(self.buffer.len());
                        let chunk = &mut self.buffer[..len];

                        let read = match (&stream.handle).read(chunk) {
                            Ok(read) => read,
                            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                            Err(e) => return Err(e.into()),
                        };

                        if read == 0 {
                            stream.open = false;
                            continue;
                        }

                        (stream.callback)(&chunk[..read]);
                        found_data = true;
                        delivered += read;
                    }
                    Availability::Empty => (),
                    Availability::Closed => {
                        tracing::debug!(target: trace_categories::READER, "{} pipe closed", stream.kind);
                        stream.open = false;
                    }
                }
            }

            if self.streams.iter().all(|s| !s.open) {
                return Ok(DrainStatus::Closed);
            }

            if !found_data {
                return Ok(DrainStatus::Idle);
            }

            if delivered >= budget {
                return Ok(DrainStatus::Progress);
            }
        }
    }

    fn child_has_exited(&self) -> Result<bool, error::Error> {
        match self.signals.pid() {
            Some(pid) => Ok(sys::process::has_exited(pid)?),
            None => Ok(true),
        }
    }

    fn wait_for_data(&self) -> Result<(), error::Error> {
        let fds: Vec<_> = self
            .streams
            .iter()
            .filter(|s| s.open)
            .filter_map(|s| s.handle.as_fd())
            .collect();

        sys::poll::wait_readable(&fds, self.poll_interval)?;
        Ok(())
    }
}

/// A running background reader thread.
pub(crate) struct ReaderTask {
    thread: JoinHandle<Result<ReaderExit, error::Error>>,
    // Never sent on; disconnects when the thread finishes, which lets `close` wait with a
    // timeout.
    finished: mpsc::Receiver<Infallible>,
}

impl ReaderTask {
    /// Starts `reader` on its own thread.
    pub(crate) fn spawn(
        reader: StreamingReader,
        on_error: Option<ReaderErrorCallback>,
        pid: ProcessId,
    ) -> Result<Self, error::Error> {
        let (finished_sender, finished) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(format!("procpipe-reader-{pid}"))
            .spawn(move || {
                let _finished_sender = finished_sender;

                let result = reader.run();
                match &result {
                    Ok(exit) => {
                        tracing::debug!(target: trace_categories::READER, "reader for pid {pid} stopped: {exit:?}");
                    }
                    Err(e) => {
                        tracing::error!(target: trace_categories::READER, op = "read", "reader for pid {pid} failed: {e}");
                        if let Some(on_error) = on_error {
                            on_error(e);
                        }
                    }
                }

                result
            })
            .map_err(error::Error::ReaderSpawnFailure)?;

        Ok(Self { thread, finished })
    }

    /// Waits up to `timeout` for the thread to finish; returns whether it did.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        match self.finished.recv_timeout(timeout) {
            Ok(never) => match never {},
            Err(mpsc::RecvTimeoutError::Disconnected) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Joins the thread, blocking until it finishes.
    pub(crate) fn join(self) -> Result<ReaderExit, error::Error> {
        self.thread
            .join()
            .map_err(|_panic| error::Error::ReaderPanicked)?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;
    use std::os::fd::OwnedFd;
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;

    fn collector() -> (Arc<Mutex<Vec<u8>>>, OutputCallback) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let callback: OutputCallback = Box::new(move |bytes: &[u8]| {
            sink.lock().unwrap().extend_from_slice(bytes);
        });
        (collected, callback)
    }

    fn signals_without_child() -> Arc<ReaderSignals> {
        // A zero pid reads as an already invalidated process handle.
        Arc::new(ReaderSignals::new(0))
    }

    #[test]
    fn drain_delivers_bytes_in_order_in_bounded_chunks() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let (collected, callback) = collector();

        let mut streaming = StreamingReader::new(4, Duration::from_millis(1), signals_without_child());
        streaming.add_stream(StdStream::Stdout, Handle::from(reader), callback);

        writer.write_all(b"0123456789").unwrap();
        assert_eq!(streaming.drain(usize::MAX).unwrap(), DrainStatus::Idle);
        assert_eq!(*collected.lock().unwrap(), b"0123456789".to_vec());

        drop(writer);
        assert_eq!(streaming.drain(usize::MAX).unwrap(), DrainStatus::Closed);
    }

    #[test]
    fn idle_stdout_does_not_starve_stderr() {
        let (out_reader, _out_writer) = os_pipe::pipe().unwrap();
        let (err_reader, mut err_writer) = os_pipe::pipe().unwrap();
        let (_out, out_callback) = collector();
        let (err, err_callback) = collector();

        let mut streaming = StreamingReader::new(64, Duration::from_millis(1), signals_without_child());
        streaming.add_stream(StdStream::Stdout, Handle::from(out_reader), out_callback);
        streaming.add_stream(StdStream::Stderr, Handle::from(err_reader), err_callback);

        err_writer.write_all(b"oops").unwrap();
        assert_eq!(streaming.drain(usize::MAX).unwrap(), DrainStatus::Idle);
        assert_eq!(*err.lock().unwrap(), b"oops".to_vec());
    }

    #[test]
    fn run_stops_when_pipes_close() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let (collected, callback) = collector();

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        #[allow(clippy::cast_possible_wrap)]
        let signals = Arc::new(ReaderSignals::new(child.id() as ProcessId));

        let mut streaming = StreamingReader::new(4096, Duration::from_millis(1), signals);
        streaming.add_stream(StdStream::Stdout, Handle::from(reader), callback);

        writer.write_all(b"bye").unwrap();
        drop(writer);

        assert_eq!(streaming.run().unwrap(), ReaderExit::PipesClosed);
        assert_eq!(*collected.lock().unwrap(), b"bye".to_vec());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn run_honors_stop_request() {
        let (reader, _writer) = os_pipe::pipe().unwrap();
        let (_collected, callback) = collector();

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        #[allow(clippy::cast_possible_wrap)]
        let signals = Arc::new(ReaderSignals::new(child.id() as ProcessId));
        signals.request_stop();

        let mut streaming = StreamingReader::new(4096, Duration::from_millis(1), Arc::clone(&signals));
        streaming.add_stream(StdStream::Stdout, Handle::from(reader), callback);

        assert_eq!(streaming.run().unwrap(), ReaderExit::Stopped);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn run_flushes_once_after_child_handle_is_invalidated() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let (collected, callback) = collector();

        let signals = signals_without_child();
        let mut streaming = StreamingReader::new(4096, Duration::from_millis(1), Arc::clone(&signals));
        streaming.add_stream(StdStream::Stdout, Handle::from(reader), callback);

        // The write end stays open (as if held by a grandchild), so only the invalid process
        // handle ends the loop.
        writer.write_all(b"tail").unwrap();
        assert_eq!(streaming.run().unwrap(), ReaderExit::ChildExited);
        assert_eq!(*collected.lock().unwrap(), b"tail".to_vec());
        assert!(signals.pid().is_none());
    }

    #[test]
    fn exited_child_output_is_delivered_in_full_with_tiny_chunks() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let (collected, callback) = collector();

        let mut streaming = StreamingReader::new(1, Duration::from_millis(1), signals_without_child());
        streaming.add_stream(StdStream::Stdout, Handle::from(reader), callback);

        // A full pipe buffer, with the writer still open so that only the exit check can end
        // the loop.
        let data = vec![b'a'; 16 * 1024];
        writer.write_all(&data).unwrap();

        assert_eq!(streaming.run().unwrap(), ReaderExit::ChildExited);
        assert_eq!(collected.lock().unwrap().len(), data.len());
    }

    #[test]
    fn read_error_ends_the_reader_and_reaches_the_error_callback() {
        // FIONREAD is not supported on a directory.
        let dir = std::fs::File::open(std::env::temp_dir()).unwrap();
        let (_collected, callback) = collector();

        let mut streaming = StreamingReader::new(4096, Duration::from_millis(1), signals_without_child());
        streaming.add_stream(StdStream::Stdout, Handle::from(OwnedFd::from(dir)), callback);

        let reported = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&reported);
        let on_error: ReaderErrorCallback = Box::new(move |e: &error::Error| {
            *sink.lock().unwrap() = Some(e.to_string());
        });

        let task = ReaderTask::spawn(streaming, Some(on_error), 0).unwrap();
        assert!(task.wait(Duration::from_secs(10)));
        assert!(task.join().is_err());
        assert!(reported.lock().unwrap().is_some());
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_callback_is_reported_on_join() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();

        let mut streaming = StreamingReader::new(4096, Duration::from_millis(1), signals_without_child());
        streaming.add_stream(
            StdStream::Stdout,
            Handle::from(reader),
            Box::new(|_bytes: &[u8]| panic!("callback failed")),
        );
        writer.write_all(b"x").unwrap();

        let task = ReaderTask::spawn(streaming, None, 0).unwrap();
        assert!(task.wait(Duration::from_secs(10)));
        assert!(matches!(task.join(), Err(error::Error::ReaderPanicked)));
    }

    #[test]
    fn task_reports_completion() {
        let (reader, writer) = os_pipe::pipe().unwrap();
        let (_collected, callback) = collector();

        let mut streaming = StreamingReader::new(4096, Duration::from_millis(1), signals_without_child());
        streaming.add_stream(StdStream::Stdout, Handle::from(reader), callback);
        drop(writer);

        let task = ReaderTask::spawn(streaming, None, 0).unwrap();
        assert!(task.wait(Duration::from_secs(10)));
        assert_eq!(task.join().unwrap(), ReaderExit::PipesClosed);
    }
}
