//! Tracing setup. Logs always go to stderr; stdout is reserved for command
//! output such as the device listing.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct LogConfig {
    /// Output logs as JSON
    pub json: bool,
    /// Default level DEBUG instead of INFO
    pub verbose: bool,
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub fn default_directive(&self) -> String {
        let level = if self.verbose { Level::DEBUG } else { Level::INFO };
        format!("nasfilecopy={}", level.as_str().to_lowercase())
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_selects_debug() {
        assert_eq!(LogConfig::default().default_directive(), "nasfilecopy=info");
        let verbose = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert_eq!(verbose.default_directive(), "nasfilecopy=debug");
    }
}
