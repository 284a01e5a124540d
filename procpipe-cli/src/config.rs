//! Configuration file support for `procpipe`.
//!
//! Settings are read from an optional TOML file and layered as:
//! defaults < config file < command-line arguments. Unknown fields are ignored.

use etcetera::BaseStrategy;
use procpipe_core::{CloseTimeout, LineTerminator};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::args::{CommandLineArgs, LineTerminatorArg};

/// Root configuration structure.
///
/// All fields are optional so that partial files are accepted.
#[derive(Debug, Default, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings for the launched process.
    pub process: ProcessSection,

    /// Settings for relayed output.
    pub output: OutputSection,
}

/// Settings for the launched process.
#[derive(Debug, Default, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ProcessSection {
    /// Terminator appended to forwarded commands.
    #[serde(rename = "line-terminator")]
    pub line_terminator: Option<LineTerminatorArg>,

    /// How long shutdown waits for the output reader, in milliseconds. Zero waits
    /// indefinitely.
    #[serde(rename = "close-timeout-ms")]
    pub close_timeout_ms: Option<u64>,

    /// Bytes read from a pipe per delivered chunk.
    #[serde(rename = "read-chunk-size")]
    pub read_chunk_size: Option<usize>,

    /// Longest idle wait of the output reader, in milliseconds.
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: Option<u64>,

    /// Delay before each synchronous read, in milliseconds.
    #[serde(rename = "read-line-delay-ms")]
    pub read_line_delay_ms: Option<u64>,

    /// Run the program in its own process group.
    #[serde(rename = "detach")]
    pub detach: Option<bool>,
}

/// Settings for relayed output.
#[derive(Debug, Default, Clone, serde::Deserialize)]
#[serde(default)]
pub struct OutputSection {
    /// Text inserted at the start of each stdout line.
    #[serde(rename = "stdout-prefix")]
    pub stdout_prefix: Option<String>,

    /// Text inserted at the start of each stderr line.
    #[serde(rename = "stderr-prefix")]
    pub stderr_prefix: Option<String>,
}

/// Effective settings after merging the config file with command-line arguments. Values left
/// `None` fall back to the library defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Terminator appended to forwarded commands.
    pub line_terminator: Option<LineTerminator>,
    /// Bound on how long shutdown waits for the output reader.
    pub close_timeout: Option<CloseTimeout>,
    /// Bytes read from a pipe per delivered chunk.
    pub read_chunk_size: Option<usize>,
    /// Longest idle wait of the output reader.
    pub poll_interval: Option<Duration>,
    /// Delay before each synchronous read.
    pub read_line_delay: Option<Duration>,
    /// Run the program in its own process group.
    pub detach: Option<bool>,
    /// Text inserted at the start of each stdout line.
    pub stdout_prefix: String,
    /// Text inserted at the start of each stderr line.
    pub stderr_prefix: String,
}

impl Config {
    /// Merges the configuration with command-line arguments; arguments win.
    ///
    /// # Arguments
    ///
    /// * `args` - The parsed command-line arguments
    #[must_use]
    pub fn to_settings(&self, args: &CommandLineArgs) -> Settings {
        let line_terminator = args
            .line_terminator
            .or(self.process.line_terminator)
            .map(LineTerminator::from);

        let close_timeout = self.process.close_timeout_ms.map(|ms| match ms {
            0 => CloseTimeout::Unbounded,
            ms => CloseTimeout::Bounded(Duration::from_millis(ms)),
        });

        Settings {
            line_terminator,
            close_timeout,
            read_chunk_size: self.process.read_chunk_size.filter(|size| *size > 0),
            poll_interval: self.process.poll_interval_ms.map(Duration::from_millis),
            read_line_delay: self.process.read_line_delay_ms.map(Duration::from_millis),
            detach: self.process.detach,
            stdout_prefix: merge_string_setting(
                args.stdout_prefix.as_ref(),
                self.output.stdout_prefix.as_ref(),
            ),
            stderr_prefix: merge_string_setting(
                args.stderr_prefix.as_ref(),
                self.output.stderr_prefix.as_ref(),
            ),
        }
    }
}

/// Priority: CLI > config file > empty.
fn merge_string_setting(cli_value: Option<&String>, config_value: Option<&String>) -> String {
    cli_value.or(config_value).cloned().unwrap_or_default()
}

/// Result of attempting to load a configuration file.
#[derive(Debug)]
pub struct ConfigLoadResult {
    /// The loaded configuration, or default if loading failed.
    pub config: Config,

    /// The path that was used (or attempted) for loading.
    pub path: Option<PathBuf>,

    /// Any error that occurred during loading.
    pub error: Option<ConfigLoadError>,

    /// Whether the path was explicitly provided by the user (via `--config`).
    /// If true and there's an error, startup fails rather than continuing.
    pub explicit_path: bool,
}

impl ConfigLoadResult {
    fn defaults(path: Option<PathBuf>) -> Self {
        Self {
            config: Config::default(),
            path,
            error: None,
            explicit_path: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[source] std::io::Error),

    /// Failed to parse the TOML content.
    #[error("failed to parse config file: {0}")]
    Parse(#[source] toml::de::Error),
}

/// Returns the default configuration file path for the current platform, or `None` if the
/// platform's config directory cannot be determined.
pub fn default_config_path() -> Option<PathBuf> {
    let strategy = etcetera::choose_base_strategy().ok()?;
    Some(strategy.config_dir().join("procpipe").join("config.toml"))
}

/// Loads configuration from the specified path.
pub fn load_from_path(path: &Path) -> ConfigLoadResult {
    let mut result = ConfigLoadResult::defaults(Some(path.to_path_buf()));

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => result.config = config,
            Err(e) => result.error = Some(ConfigLoadError::Parse(e)),
        },
        Err(e) => result.error = Some(ConfigLoadError::Io(e)),
    }

    result
}

/// Loads configuration based on the provided options.
///
/// # Arguments
///
/// * `disabled` - If true, skip loading and return defaults
/// * `explicit_path` - If provided, use this path instead of the default
pub fn load_config(disabled: bool, explicit_path: Option<&Path>) -> ConfigLoadResult {
    if disabled {
        return ConfigLoadResult::defaults(None);
    }

    let Some(path) = explicit_path
        .map(Path::to_path_buf)
        .or_else(default_config_path)
    else {
        return ConfigLoadResult::defaults(None);
    };

    // A missing file at the default location is simply not configured.
    if explicit_path.is_none() && !path.exists() {
        return ConfigLoadResult::defaults(Some(path));
    }

    let mut result = load_from_path(&path);
    result.explicit_path = explicit_path.is_some();
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    fn make_test_args(extra: &[&str]) -> CommandLineArgs {
        let mut argv = vec!["procpipe"];
        argv.extend_from_slice(extra);
        argv.push("true");
        CommandLineArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.process.line_terminator.is_none());
        assert!(config.process.close_timeout_ms.is_none());
        assert!(config.output.stdout_prefix.is_none());
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            [process]
            line-terminator = "lf"
            close-timeout-ms = 250
            read-chunk-size = 512
            poll-interval-ms = 2
            read-line-delay-ms = 100
            detach = false

            [output]
            stdout-prefix = "out| "
            stderr-prefix = "err| "
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.process.line_terminator, Some(LineTerminatorArg::Lf));
        assert_eq!(config.process.close_timeout_ms, Some(250));
        assert_eq!(config.process.read_chunk_size, Some(512));
        assert_eq!(config.process.detach, Some(false));
        assert_eq!(config.output.stderr_prefix.as_deref(), Some("err| "));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
            [process]
            line-terminator = "crlf"
            future-knob = 42

            [unknown-section]
            foo = "bar"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.process.line_terminator, Some(LineTerminatorArg::Crlf));
    }

    #[test]
    fn test_invalid_terminator_rejected() {
        let toml = r#"
            [process]
            line-terminator = "cr"
        "#;

        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("procpipe/config.toml"));
        }
    }

    #[test]
    fn test_load_config_disabled() {
        let result = load_config(true, None);
        assert!(result.path.is_none());
        assert!(result.error.is_none());
    }

    #[test]
    fn test_load_config_nonexistent_explicit() {
        let path = Path::new("/nonexistent/path/to/config.toml");
        let result = load_config(false, Some(path));
        assert!(result.explicit_path);
        assert!(matches!(result.error, Some(ConfigLoadError::Io(_))));
    }

    #[test]
    fn test_settings_defaults_only() {
        let settings = Config::default().to_settings(&make_test_args(&[]));

        assert_eq!(
            settings,
            Settings {
                line_terminator: None,
                close_timeout: None,
                read_chunk_size: None,
                poll_interval: None,
                read_line_delay: None,
                detach: None,
                stdout_prefix: String::new(),
                stderr_prefix: String::new(),
            }
        );
    }

    #[test]
    fn test_settings_cli_overrides_config() {
        let toml = r#"
            [process]
            line-terminator = "crlf"
            close-timeout-ms = 0

            [output]
            stdout-prefix = "config "
            stderr-prefix = "config-err "
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let args = make_test_args(&["--line-terminator", "lf", "--stdout-prefix", "cli "]);

        let settings = config.to_settings(&args);
        assert_eq!(settings.line_terminator, Some(LineTerminator::Lf));
        assert_eq!(settings.close_timeout, Some(CloseTimeout::Unbounded));
        assert_eq!(settings.stdout_prefix, "cli ");
        assert_eq!(settings.stderr_prefix, "config-err ");
    }

    #[test]
    fn test_zero_chunk_size_falls_back() {
        let config: Config = toml::from_str("[process]\nread-chunk-size = 0").unwrap();
        let settings = config.to_settings(&make_test_args(&[]));
        assert_eq!(settings.read_chunk_size, None);
    }
}
