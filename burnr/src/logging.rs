//! Tracing setup for the command-line front end.
//!
//! Logs go to stderr so they do not tear the progress bar on stdout. The
//! filter can be overridden at runtime through `RUST_LOG`.
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Default, Clone, Copy)]
pub struct LogConfig {
    /// One JSON object per event instead of human-readable lines.
    pub json: bool,
    /// Raise the default level to DEBUG.
    pub verbose: bool,
}

fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let level = level.as_str().to_lowercase();
    EnvFilter::new(format!("burnr={level},burnr_core={level}"))
}

pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.verbose));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_thread_names(config.verbose)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_both_crates() {
        let filter = default_filter(false).to_string().to_lowercase();
        assert!(filter.contains("burnr=info"));
        assert!(filter.contains("burnr_core=info"));
        let verbose = default_filter(true).to_string().to_lowercase();
        assert!(verbose.contains("burnr_core=debug"));
    }
}
