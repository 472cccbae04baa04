//! Logging initialization using the `tracing` ecosystem.
//!
//! - Console output (colored, human-readable, or JSON lines)
//! - File output (daily rotation via `tracing-appender`)
//! - Level from `RUST_LOG` when set, otherwise from [`LogOptions::level`]

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Options for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LogOptions<'a> {
    /// Default level if `RUST_LOG` is not set (e.g. `"info"`).
    pub level: &'a str,
    /// Directory for daily-rotating log files.
    pub dir: Option<&'a str>,
    /// Log file prefix (e.g. `"mux_runner"`).
    pub file_prefix: &'a str,
    /// Emit JSON lines on the console instead of the human format.
    pub json: bool,
}

impl Default for LogOptions<'_> {
    fn default() -> Self {
        Self {
            level: "info",
            dir: None,
            file_prefix: "mux",
            json: false,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at program start. Returns an error if a global subscriber is
/// already installed.
pub fn init_logging(options: &LogOptions<'_>) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(options.level));

    let (human, json) = if options.json {
        (None, Some(fmt::layer().json().with_target(true).with_thread_ids(true)))
    } else {
        (
            Some(fmt::layer().with_target(true).with_thread_ids(true).with_ansi(true)),
            None,
        )
    };

    let file = options.dir.map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, options.file_prefix);
        fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(human)
        .with(json)
        .with(file)
        .try_init()?;
    Ok(())
}
