//! Errors reported by the command-line front end.

use std::path::PathBuf;

/// Failure that ends a `procpipe` run before the child's exit code is known.
#[derive(thiserror::Error, Debug)]
pub(crate) enum CliError {
    /// The explicitly requested configuration file could not be loaded.
    #[error("{}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: crate::config::ConfigLoadError,
    },

    /// The timeout given on the command line isn't a valid duration.
    #[error("invalid timeout: {0}")]
    InvalidTimeout(f64),

    /// Launching or managing the child failed.
    #[error(transparent)]
    Process(#[from] procpipe_core::Error),

    /// An I/O error occurred on our own standard streams.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
