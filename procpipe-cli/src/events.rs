//! Tracing setup for the command-line front end.

use std::{collections::HashSet, fmt::Display};

use procpipe_core::trace_categories;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Type of event to trace.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, clap::ValueEnum)]
pub enum TraceEvent {
    /// Traces pipe creation and child process launch.
    #[clap(name = "launch")]
    Launch,
    /// Traces the output reader.
    #[clap(name = "reader")]
    Reader,
    /// Traces writes, shutdown, and termination of the child.
    #[clap(name = "lifecycle")]
    Lifecycle,
}

impl Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.target())
    }
}

impl TraceEvent {
    /// Returns the tracing target that events of this type are emitted under.
    pub const fn target(self) -> &'static str {
        match self {
            Self::Launch => trace_categories::LAUNCH,
            Self::Reader => trace_categories::READER,
            Self::Lifecycle => trace_categories::LIFECYCLE,
        }
    }
}

#[derive(Default)]
pub(crate) struct TraceEventConfig {
    enabled_trace_events: HashSet<TraceEvent>,
}

impl TraceEventConfig {
    /// Installs a global subscriber writing to stderr, with debug output enabled for the given
    /// event types.
    pub fn init(enabled_debug_events: &[TraceEvent]) -> Self {
        let config = Self {
            enabled_trace_events: enabled_debug_events.iter().copied().collect(),
        };

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .without_time()
            .with_target(false)
            .with_filter(config.compose_filter());

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            // Something went wrong; proceed on anyway but complain audibly.
            eprintln!("warning: failed to initialize tracing.");
        }

        config
    }

    fn compose_filter(&self) -> tracing_subscriber::filter::Targets {
        tracing_subscriber::filter::Targets::new()
            .with_default(tracing_subscriber::filter::LevelFilter::INFO)
            .with_targets(
                self.enabled_trace_events
                    .iter()
                    .map(|event| (event.target(), tracing::Level::DEBUG)),
            )
    }

    pub const fn get_enabled_events(&self) -> &HashSet<TraceEvent> {
        &self.enabled_trace_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn only_enabled_events_reach_debug() {
        let config = TraceEventConfig {
            enabled_trace_events: [TraceEvent::Reader].into_iter().collect(),
        };
        let filter = config.compose_filter();

        assert!(filter.would_enable("reader", &Level::DEBUG));
        assert!(!filter.would_enable("launch", &Level::DEBUG));
        assert!(filter.would_enable("launch", &Level::INFO));
        assert!(filter.would_enable("lifecycle", &Level::ERROR));
    }

    #[test]
    fn display_matches_target() {
        assert_eq!(TraceEvent::Lifecycle.to_string(), "lifecycle");
        assert_eq!(TraceEvent::Launch.to_string(), trace_categories::LAUNCH);
    }
}
