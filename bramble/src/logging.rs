// Logging for bramble
//
// Thin setup layer over the `tracing` ecosystem. The scheduler itself only
// emits events; installing a subscriber is left to the application, which can
// use the helpers below.
//
// Levels used by the pool:
// - `info`: pool started, shutdown requested, pool terminated
// - `debug`: worker started and stopped
// - `trace`: steals, hand-offs, parking
// - `warn`: a promise callback ran inline because its executor refused it
// - `error`: uncaught task panics (default panic handler), failed joins
//
// # Usage Examples
//
// ```rust
// use bramble::logging;
//
// // INFO level, console output
// logging::init_default();
//
// // DEBUG for bramble, TRACE for the scheduler internals
// logging::init_development();
//
// // JSON lines for log aggregation
// logging::init_production();
// ```
//
// Every worker thread runs inside a `worker` span:
//
// ```rust
// let span = bramble::worker_span!(pool_id, 3);
// let _guard = span.enter();
// bramble::log_scheduler!("steal", victim = 1, prefetched = 4);
// ```

use std::io;
use std::sync::Once;

use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configuration for the logging setup helpers
///
/// # Examples
///
/// ```rust
/// use bramble::logging::LogConfig;
/// use tracing::Level;
///
/// let config = LogConfig {
///     level: Level::DEBUG,
///     target_filters: Some("bramble::pool=trace".to_string()),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            show_time: true,
            target_filters: None,
        }
    }
}

// Only the first initialization takes effect
static INIT: Once = Once::new();

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());
    if let Some(filters) = &config.target_filters {
        for directive in filters.split(',') {
            if let Ok(directive) = directive.trim().parse() {
                filter = filter.add_directive(directive);
            }
        }
    }
    filter
}

/// Installs the global subscriber described by `config`.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(env_filter(&config));

        let subscriber: Box<dyn Subscriber + Send + Sync> = if config.json_format {
            Box::new(
                registry.with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            )
        } else if config.show_time {
            Box::new(
                registry.with(
                    fmt::layer()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            )
        } else {
            Box::new(
                registry.with(
                    fmt::layer()
                        .without_time()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            )
        };

        set_global_subscriber(subscriber);
    });
}

fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {}", err);
    }
}

/// Opens `path` for appending, creating it if needed.
///
/// # Errors
/// Returns an error if the file cannot be opened or created
pub fn file_writer(path: &str) -> io::Result<Box<dyn io::Write + Send + Sync + 'static>> {
    use std::fs::OpenOptions;

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(file))
}

/// Logs to the console and, without colors, to `log_file`.
///
/// # Errors
/// Returns an error if `log_file` cannot be opened. Nothing is installed then.
pub fn init_with_file(config: LogConfig, log_file: &str) -> Result<(), io::Error> {
    // fail early instead of inside the writer closure
    file_writer(log_file)?;

    INIT.call_once(|| {
        let console_layer = fmt::layer()
            .with_ansi(atty::is(atty::Stream::Stdout))
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_thread_names(config.show_thread_info)
            .with_thread_ids(config.show_thread_info);

        let log_file_path = log_file.to_string();
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(move || match file_writer(&log_file_path) {
                Ok(writer) => writer,
                Err(_) => Box::new(io::stderr()),
            })
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_thread_ids(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer)
            .with(file_layer);

        set_global_subscriber(subscriber);
    });

    Ok(())
}

/// INFO level, human-readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// DEBUG for bramble and TRACE for the scheduler, with file/line information.
pub fn init_development() {
    init(LogConfig {
        level: Level::DEBUG,
        json_format: false,
        show_file_line: true,
        show_thread_info: true,
        show_time: true,
        target_filters: Some("bramble=debug,bramble::pool=trace".to_string()),
    });
}

/// INFO level, JSON lines, no file/line information.
pub fn init_production() {
    init(LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        show_thread_info: true,
        show_time: true,
        target_filters: None,
    });
}

/// WARN level and compact output to keep test logs quiet.
///
/// ```rust
/// #[test]
/// fn my_test() {
///     bramble::logging::init_test();
///     // ...
/// }
/// ```
pub fn init_test() {
    init(LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        target_filters: None,
    });
}

/// Span for everything a worker thread does.
///
/// ```rust
/// let span = bramble::worker_span!("7b0c", 2);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! worker_span {
    ($pool_id:expr, $index:expr) => {
        tracing::info_span!("worker", pool = %$pool_id, index = $index)
    };
    ($pool_id:expr, $index:expr, $($fields:tt)*) => {
        tracing::info_span!("worker", pool = %$pool_id, index = $index, $($fields)*)
    };
}

/// Scheduler-internal event at TRACE level.
///
/// ```rust
/// bramble::log_scheduler!("park");
/// bramble::log_scheduler!("steal", victim = 3, prefetched = 4);
/// ```
#[macro_export]
macro_rules! log_scheduler {
    ($event:expr) => {
        tracing::trace!(event = $event);
    };
    ($event:expr, $($fields:tt)*) => {
        tracing::trace!(event = $event, $($fields)*);
    };
}

/// Pool lifecycle event at INFO level.
///
/// ```rust
/// bramble::log_pool!("7b0c", "started", workers = 8);
/// ```
#[macro_export]
macro_rules! log_pool {
    ($pool_id:expr, $event:expr) => {
        tracing::info!(pool = %$pool_id, event = $event);
    };
    ($pool_id:expr, $event:expr, $($fields:tt)*) => {
        tracing::info!(pool = %$pool_id, event = $event, $($fields)*);
    };
}

pub use tracing::{debug, error, info, trace, warn};
