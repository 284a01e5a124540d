//! Pipe creation and child process launch.

use std::os::fd::OwnedFd;
use std::process::{Command, Stdio};

use crate::sys::process::ProcessId;
use crate::{Handle, ProcessConfig, StdStream, error, sys, trace_categories};

/// A freshly launched child together with the parent-side ends of its redirected streams.
/// Ends for streams that were not redirected are invalid handles.
pub(crate) struct LaunchedProcess {
    pub child: std::process::Child,
    pub pid: ProcessId,
    pub stdin: Handle,
    pub stdout: Handle,
    pub stderr: Handle,
}

/// Creates the requested pipes and starts the child bound to them.
///
/// Every handle created along the way is owned by a local value until the launch succeeds, so
/// an early return on any failure closes all of them; nothing leaks on any exit path.
pub(crate) fn launch(config: &ProcessConfig) -> Result<LaunchedProcess, error::Error> {
    let program = config.program_display();

    let mut command = Command::new(&config.program);
    command.args(&config.args);

    if let Some(dir) = &config.current_dir {
        command.current_dir(dir);
    }

    if let Some(environment) = &config.environment {
        command.env_clear();
        command.envs(environment.iter().map(|(name, value)| (name, value)));
    }

    if config.hide_window {
        sys::process::detach_from_terminal(&mut command);
    }

    // When any stream is redirected, the ones that aren't get no stream at all; otherwise the
    // child shares ours.
    let unredirected = || {
        if config.redirects_any() {
            Stdio::null()
        } else {
            Stdio::inherit()
        }
    };

    let mut stdout = Handle::invalid();
    if config.redirect_stdout {
        let (parent, child) = create_pipe(StdStream::Stdout)?;
        stdout = parent;
        command.stdout(child);
    } else {
        command.stdout(unredirected());
    }

    let mut stdin = Handle::invalid();
    if config.redirect_stdin {
        let (parent, child) = create_pipe(StdStream::Stdin)?;
        stdin = parent;
        command.stdin(child);
    } else {
        command.stdin(unredirected());
    }

    let mut stderr = Handle::invalid();
    if config.redirect_stderr {
        let (parent, child) = create_pipe(StdStream::Stderr)?;
        stderr = parent;
        command.stderr(child);
    } else {
        command.stderr(unredirected());
    }

    tracing::debug!(target: trace_categories::LAUNCH, "launching: {config:?}");

    let child = command.spawn().map_err(|source| {
        tracing::error!(target: trace_categories::LAUNCH, op = "spawn", "failed to launch '{program}': {source}");
        error::Error::ChildCreationFailure {
            program: program.clone(),
            source,
        }
    })?;

    // The command still holds the child-side pipe ends; dropping it leaves the child with the
    // only copies, so our readers see end-of-file once the child's writers are gone.
    drop(command);

    #[allow(clippy::cast_possible_wrap)]
    let pid = child.id() as ProcessId;

    tracing::debug!(target: trace_categories::LAUNCH, "launched '{program}' as pid {pid}");

    Ok(LaunchedProcess {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// Creates a pipe for the given stream, returning the end kept by the parent and the end to
/// be bound to the child's standard descriptor.
fn create_pipe(stream: StdStream) -> Result<(Handle, Stdio), error::Error> {
    let (reader, writer) = sys::pipes::create().map_err(|e| {
        tracing::error!(target: trace_categories::LAUNCH, op = "create_pipe", "failed to create {stream} pipe: {e}");
        error::Error::PipeCreationFailed(stream, e)
    })?;

    let (parent, child) = match stream {
        StdStream::Stdin => (Handle::from(writer), OwnedFd::from(reader)),
        StdStream::Stdout | StdStream::Stderr => (Handle::from(reader), OwnedFd::from(writer)),
    };

    Ok((parent, Stdio::from(child)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn only_requested_streams_get_parent_handles() {
        let config = ProcessConfig::builder()
            .program("true")
            .redirect_stdin(false)
            .redirect_stderr(false)
            .build();

        let mut launched = launch(&config).unwrap();
        assert!(launched.stdout.is_valid());
        assert!(!launched.stdin.is_valid());
        assert!(!launched.stderr.is_valid());
        assert!(launched.pid > 0);

        launched.child.wait().unwrap();
    }

    #[test]
    fn stdout_reaches_eof_when_child_exits() {
        let config = ProcessConfig::builder()
            .program("printf")
            .args(vec!["abc".into()])
            .build();

        let mut launched = launch(&config).unwrap();

        // Reading to the end only terminates if no stray copy of the write end survives in
        // this process.
        let mut output = Vec::new();
        (&launched.stdout).read_to_end(&mut output).unwrap();
        assert_eq!(output, b"abc");

        launched.child.wait().unwrap();
    }

    #[test]
    fn missing_program_is_reported() {
        let config = ProcessConfig::builder()
            .program("/nonexistent/procpipe-test-program")
            .build();

        let result = launch(&config);
        assert!(matches!(
            result,
            Err(error::Error::ChildCreationFailure { .. })
        ));
    }
}
