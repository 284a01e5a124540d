//! Implements the command-line interface for `procpipe`.

/// Main entry point for `procpipe`.
fn main() {
    procpipe_cli::entry::run();
}
