//! Implements the command-line interface for `procpipe`.

use std::ffi::OsString;
use std::io::Stdout;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use clap::Parser;
use procpipe_core::{ProcessConfig, ProcessInstance, trace_categories};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::signal::unix::{SignalKind, signal};

use crate::args::CommandLineArgs;
use crate::config::{self, Settings};
use crate::error::CliError;
use crate::output::{self, LinePrefixer};
use crate::{events, productinfo};

/// How often the child is checked for exit while nothing else happens.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long output still in flight after the child exits is given to arrive.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Exit code reported when procpipe itself fails.
const FAILURE_EXIT_CODE: u8 = 1;

/// Main entry point for `procpipe`.
pub fn run() {
    //
    // Set up panic handler. On release builds, it will capture panic details to a
    // temporary .toml file and report a human-readable message to the screen.
    //
    human_panic::setup_panic!(
        human_panic::Metadata::new(productinfo::PRODUCT_NAME, productinfo::PRODUCT_VERSION)
            .homepage(productinfo::PRODUCT_DISPLAY_URI)
    );

    //
    // Parse args.
    //
    let parsed_args = match CommandLineArgs::try_parse() {
        Ok(parsed_args) => parsed_args,
        Err(e) => {
            let _ = e.print();

            // clap returns errors for `--help` and `--version` too.
            let exit_code = match e.kind() {
                clap::error::ErrorKind::DisplayVersion | clap::error::ErrorKind::DisplayHelp => 0,
                _ => i32::from(FAILURE_EXIT_CODE),
            };

            std::process::exit(exit_code);
        }
    };

    //
    // Run.
    //
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            std::process::exit(i32::from(FAILURE_EXIT_CODE));
        }
    };

    let exit_code = match runtime.block_on(run_async(parsed_args)) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("error: {err:#}");
            FAILURE_EXIT_CODE
        }
    };

    std::process::exit(i32::from(exit_code));
}

/// Runs the requested program to completion. Returns the exit code to report.
async fn run_async(args: CommandLineArgs) -> Result<u8, CliError> {
    // Initializing tracing.
    let event_config = events::TraceEventConfig::init(&args.enabled_debug_events);
    tracing::debug!(
        target: trace_categories::LIFECYCLE,
        "{}; debug events: {:?}",
        productinfo::get_product_display_str(),
        event_config.get_enabled_events()
    );

    let settings = load_settings(&args)?;

    let timeout = args
        .timeout
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(|_| CliError::InvalidTimeout(secs)))
        .transpose()?;

    // In synchronous mode stdout is consumed by explicit reads, never by the streaming reader.
    let mut sync_output = args
        .sync
        .then(|| LinePrefixer::new(settings.stdout_prefix.as_str(), std::io::stdout()));

    let mut process = ProcessInstance::spawn(build_process_config(&args, &settings))?;

    let status = supervise(&mut process, &args, timeout, sync_output.as_mut()).await;

    // Give output still buffered in the pipes a chance to be relayed before shutting the
    // reader down.
    let drain_deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    while process.is_reader_running() && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    if let Some(sync_output) = sync_output.as_mut() {
        sync_output.write_chunk(&process.read_available()?)?;
    }

    process.close();

    Ok(exit_code_of(status?))
}

/// Loads the configuration file and merges it with the command line. A broken file at the
/// default location is reported and ignored; a broken explicit one is fatal.
fn load_settings(args: &CommandLineArgs) -> Result<Settings, CliError> {
    let result = config::load_config(args.no_config, args.config_file.as_deref());

    if let Some(error) = result.error {
        let path = result.path.unwrap_or_default();
        if result.explicit_path {
            return Err(CliError::Config {
                path,
                source: error,
            });
        }

        tracing::warn!("ignoring {}: {error}", path.display());
    }

    Ok(result.config.to_settings(args))
}

fn build_process_config(args: &CommandLineArgs, settings: &Settings) -> ProcessConfig {
    let on_stdout = (!args.no_stdout && !args.sync)
        .then(|| output::relay(&settings.stdout_prefix, std::io::stdout(), "stdout"));
    let on_stderr = (!args.no_stderr)
        .then(|| output::relay(&settings.stderr_prefix, std::io::stderr(), "stderr"));

    ProcessConfig::builder()
        .program(args.program())
        .args(args.program_args().to_vec())
        .maybe_current_dir(args.current_dir.clone())
        .maybe_environment(compose_environment(args))
        .maybe_on_stdout(on_stdout)
        .maybe_on_stderr(on_stderr)
        .on_reader_error(Box::new(|e: &procpipe_core::Error| {
            tracing::error!("output relay stopped: {e}");
        }))
        .redirect_stdin(!args.no_stdin)
        .redirect_stdout(!args.no_stdout)
        .redirect_stderr(!args.no_stderr)
        .maybe_hide_window(settings.detach)
        .maybe_read_chunk_size(settings.read_chunk_size)
        .maybe_poll_interval(settings.poll_interval)
        .maybe_read_line_delay(settings.read_line_delay)
        .maybe_close_timeout(settings.close_timeout)
        .maybe_line_terminator(settings.line_terminator)
        .build()
}

/// Returns the complete environment for the child, or `None` to inherit ours unchanged.
fn compose_environment(args: &CommandLineArgs) -> Option<Vec<(OsString, OsString)>> {
    if !args.clear_env && args.env.is_empty() {
        return None;
    }

    let mut environment: Vec<(OsString, OsString)> = if args.clear_env {
        vec![]
    } else {
        std::env::vars_os().collect()
    };

    for (key, value) in &args.env {
        environment.retain(|(existing, _)| existing.as_os_str() != key.as_str());
        environment.push((key.into(), value.into()));
    }

    Some(environment)
}

enum Event {
    Interrupted,
    TimedOut,
    Input(std::io::Result<Option<String>>),
    Tick,
}

/// Waits for the child to exit while handling interrupts, the optional timeout, and forwarding
/// of input lines.
async fn supervise(
    process: &mut ProcessInstance,
    args: &CommandLineArgs,
    timeout: Option<Duration>,
    mut sync_output: Option<&mut LinePrefixer<Stdout>>,
) -> Result<ExitStatus, CliError> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
    let mut timed_out = false;

    let mut input = args
        .interactive
        .then(|| BufReader::new(tokio::io::stdin()).lines());

    loop {
        if let Some(status) = process.try_wait()? {
            return Ok(status);
        }

        let event = tokio::select! {
            _ = interrupt.recv() => Event::Interrupted,
            () = sleep_until(deadline), if !timed_out => Event::TimedOut,
            line = next_line(input.as_mut()), if input.is_some() => Event::Input(line),
            () = tokio::time::sleep(EXIT_POLL_INTERVAL) => Event::Tick,
        };

        match event {
            Event::Interrupted => {
                tracing::debug!(target: trace_categories::LIFECYCLE, "interrupted; terminating pid {}", process.id());
                process.kill()?;
            }
            Event::TimedOut => {
                tracing::warn!("timed out; terminating pid {}", process.id());
                process.kill()?;
                timed_out = true;
            }
            Event::Input(Ok(Some(line))) => {
                if let Err(e) = forward_line(process, &line, sync_output.as_deref_mut()) {
                    tracing::warn!("stopped forwarding input: {e}");
                    process.close_stdin();
                    input = None;
                }
            }
            Event::Input(Ok(None)) => {
                // End of our input is end of the child's.
                process.close_stdin();
                input = None;
            }
            Event::Input(Err(e)) => {
                tracing::warn!("failed to read input: {e}");
                process.close_stdin();
                input = None;
            }
            Event::Tick => (),
        }
    }
}

/// Sends one line to the child. In synchronous mode, relays the child's immediate response.
fn forward_line(
    process: &ProcessInstance,
    line: &str,
    sync_output: Option<&mut LinePrefixer<Stdout>>,
) -> Result<(), CliError> {
    process.write_command(line)?;

    if let Some(sync_output) = sync_output {
        let response = tokio::task::block_in_place(|| process.read_line());
        sync_output.write_chunk(response.as_bytes())?;
    }

    Ok(())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_line(
    input: Option<&mut Lines<BufReader<Stdin>>>,
) -> std::io::Result<Option<String>> {
    match input {
        Some(input) => input.next_line().await,
        None => std::future::pending().await,
    }
}

/// Maps the child's exit status to our exit code: its own code, or 128 plus the number of the
/// signal that ended it.
fn exit_code_of(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return u8::try_from(code & 0xff).unwrap_or(FAILURE_EXIT_CODE);
    }

    status
        .signal()
        .and_then(|signal| u8::try_from(128 + signal).ok())
        .unwrap_or(FAILURE_EXIT_CODE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_code_passes_through() {
        assert_eq!(exit_code_of(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[test]
    fn signal_maps_above_128() {
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code_of(ExitStatus::from_raw(2)), 130);
    }

    #[test]
    fn environment_is_inherited_untouched_by_default() {
        let args = CommandLineArgs::try_parse_from(["procpipe", "env"]).unwrap();
        assert!(compose_environment(&args).is_none());
    }

    #[test]
    fn cleared_environment_holds_only_assignments() {
        let args = CommandLineArgs::try_parse_from([
            "procpipe",
            "--clear-env",
            "-e",
            "A=1",
            "-e",
            "A=2",
            "env",
        ])
        .unwrap();

        assert_eq!(
            compose_environment(&args),
            Some(vec![("A".into(), "2".into())])
        );
    }
}
