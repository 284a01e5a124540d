//! Trace utilities

/// Trace category for pipe creation and child launch.
pub const LAUNCH: &str = "launch";
/// Trace category for the background and synchronous readers.
pub const READER: &str = "reader";
/// Trace category for writes, close and kill.
pub const LIFECYCLE: &str = "lifecycle";
