//! Command-line arguments for `procpipe`.

use clap::{Parser, builder::styling};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use crate::{events, productinfo};

const SHORT_DESCRIPTION: &str = "Run a program with piped standard streams";

const LONG_DESCRIPTION: &str = r"
procpipe launches a program with its standard streams connected to pipes, relays whatever it
writes to stdout and stderr, and optionally forwards lines typed on our own stdin to it as
commands.

Interrupting procpipe (Ctrl-C) terminates the program along with the processes it started.
";

/// Line terminator appended to each forwarded command.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineTerminatorArg {
    /// Carriage return followed by line feed.
    Crlf,
    /// Line feed only.
    Lf,
}

impl From<LineTerminatorArg> for procpipe_core::LineTerminator {
    fn from(value: LineTerminatorArg) -> Self {
        match value {
            LineTerminatorArg::Crlf => Self::CrLf,
            LineTerminatorArg::Lf => Self::Lf,
        }
    }
}

/// Parsed command-line arguments for `procpipe`.
#[derive(Parser)]
#[clap(name = productinfo::PRODUCT_NAME,
       version = productinfo::PRODUCT_VERSION,
       about = SHORT_DESCRIPTION,
       long_about = LONG_DESCRIPTION,
       styles = procpipe_help_styles())]
#[allow(clippy::module_name_repetitions)]
pub struct CommandLineArgs {
    /// Don't connect the program's stdin to a pipe.
    #[clap(long = "no-stdin")]
    pub no_stdin: bool,

    /// Don't capture the program's stdout.
    #[clap(long = "no-stdout")]
    pub no_stdout: bool,

    /// Don't capture the program's stderr.
    #[clap(long = "no-stderr")]
    pub no_stderr: bool,

    /// Working directory for the program.
    #[clap(short = 'C', long = "cwd", value_name = "DIR")]
    pub current_dir: Option<PathBuf>,

    /// Start the program with an empty environment (plus any `--env` assignments).
    #[clap(long = "clear-env")]
    pub clear_env: bool,

    /// Set an environment variable for the program.
    #[clap(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env_assignment)]
    pub env: Vec<(String, String)>,

    /// Forward lines read from stdin to the program as commands.
    #[clap(short = 'i', long = "interactive", conflicts_with = "no_stdin")]
    pub interactive: bool,

    /// In interactive mode, answer each forwarded line with a single synchronous read instead
    /// of streaming the program's stdout.
    #[clap(long = "sync", requires = "interactive", conflicts_with = "no_stdout")]
    pub sync: bool,

    /// Line terminator appended to forwarded commands.
    #[clap(long = "line-terminator", value_name = "TERMINATOR")]
    pub line_terminator: Option<LineTerminatorArg>,

    /// Text to insert at the start of each line of the program's stdout.
    #[clap(long = "stdout-prefix", value_name = "TEXT")]
    pub stdout_prefix: Option<String>,

    /// Text to insert at the start of each line of the program's stderr.
    #[clap(long = "stderr-prefix", value_name = "TEXT")]
    pub stderr_prefix: Option<String>,

    /// Terminate the program (and the processes it started) after this many seconds.
    #[clap(long = "timeout", value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Path to a configuration file to use instead of the default.
    #[clap(long = "config", value_name = "PATH", env = "PROCPIPE_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Don't load any configuration file.
    #[clap(long = "no-config", conflicts_with = "config_file")]
    pub no_config: bool,

    /// Enable debug logging for classes of tracing events.
    #[clap(long = "log-enable", value_name = "EVENT")]
    pub enabled_debug_events: Vec<events::TraceEvent>,

    /// The program to run, followed by its arguments.
    // `trailing_var_arg`: everything after the program belongs to it, flags included.
    #[clap(
        value_name = "PROGRAM",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<OsString>,
}

impl CommandLineArgs {
    /// Returns the program to run.
    pub fn program(&self) -> &OsStr {
        // clap guarantees at least one value.
        self.command
            .first()
            .map(OsString::as_os_str)
            .unwrap_or_default()
    }

    /// Returns the arguments to pass to the program.
    pub fn program_args(&self) -> &[OsString] {
        self.command.get(1..).unwrap_or_default()
    }
}

/// Parses a `KEY=VALUE` environment assignment.
fn parse_env_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, found '{s}'")),
    }
}

/// Returns clap styling to be used for command-line help.
#[doc(hidden)]
fn procpipe_help_styles() -> clap::builder::Styles {
    styling::Styles::styled()
        .header(
            styling::AnsiColor::Yellow.on_default()
                | styling::Effects::BOLD
                | styling::Effects::UNDERLINE,
        )
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::AnsiColor::Magenta.on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default())
}
