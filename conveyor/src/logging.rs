// Logging for Conveyor
//
// Conveyor logs through `tracing`. Nothing is printed until the embedding
// application installs a subscriber, either its own or one of the presets
// below.
//
// # Usage Examples
//
// ```rust
// use conveyor::logging;
//
// // INFO level, console output
// logging::init_default();
//
// // Or pick the settings
// let config = logging::LogConfig {
//     level: tracing::Level::DEBUG,
//     json_format: false,
//     ..Default::default()
// };
// logging::init(config);
// ```
//
// Lifecycle, scheduler and flow events carry structured fields, so a filter
// like `RUST_LOG=conveyor::pipeline=debug` is usually enough to follow a
// pipeline drain:
//
// ```rust
// conveyor::log_flow!("faces", "finished", total = 12);
// conveyor::log_lifecycle!("worker", "7f0c", "deactivating");
// ```

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Mutex, Once};

use tracing::{Level, Subscriber};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Settings of the subscriber installed by [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level, unless `RUST_LOG` says otherwise
    pub level: Level,
    /// Emit one JSON object per event
    pub json_format: bool,
    /// Include source file and line
    pub show_file_line: bool,
    /// Include thread name and id. Pool threads are named, so this is on by default.
    pub show_thread_info: bool,
    /// Include timestamps
    pub show_time: bool,
    /// Extra directives (format: "target=level,target2=level2,...")
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

static INIT: Once = Once::new();

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());
    if let Some(filters) = &config.target_filters {
        for directive in filters.split(',').filter(|d| !d.trim().is_empty()) {
            match directive.trim().parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => eprintln!("Ignoring log directive `{}`: {}", directive, err),
            }
        }
    }
    filter
}

/// Installs the global subscriber. Only the first call of any `init*`
/// function takes effect.
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
        } else {
            let layer = fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stdout))
                .with_file(config.show_file_line)
                .with_line_number(config.show_file_line)
                .with_thread_names(config.show_thread_info)
                .with_thread_ids(config.show_thread_info);
            if config.show_time {
                Box::new(registry.with(layer))
            } else {
                Box::new(registry.with(layer.without_time()))
            }
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
pub fn file_writer(path: impl AsRef<Path>) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Like [`init`], with every event also appended to `log_file` without
/// colors.
///
/// # Errors
/// Returns an error if the file cannot be opened. Nothing is installed then.
pub fn init_with_file(config: LogConfig, log_file: impl AsRef<Path>) -> io::Result<()> {
    let file = file_writer(log_file)?;

    INIT.call_once(|| {
        let console_layer = fmt::layer()
            .with_ansi(atty::is(atty::Stream::Stdout))
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_thread_names(config.show_thread_info)
            .with_thread_ids(config.show_thread_info);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
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

/// INFO level, human readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// DEBUG for conveyor with TRACE for actor and scheduler internals.
pub fn init_development() {
    init(LogConfig {
        level: Level::DEBUG,
        target_filters: Some("conveyor=debug,conveyor::thread=trace".to_string()),
        ..Default::default()
    });
}

/// INFO level JSON output without source locations.
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

/// Warnings and errors only, compact, for test binaries.
///
/// ```rust
/// #[test]
/// fn my_test() {
///     conveyor::logging::init_test();
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

/// Span around the run of one actor on a pool thread.
///
/// ```rust
/// let span = conveyor::actor_span!("worker", "7f0c", name = "detector");
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! actor_span {
    ($actor_type:expr, $actor_id:expr) => {
        tracing::debug_span!("actor", kind = $actor_type, id = %$actor_id)
    };
    ($actor_type:expr, $actor_id:expr, $($fields:tt)*) => {
        tracing::debug_span!("actor", kind = $actor_type, id = %$actor_id, $($fields)*)
    };
}

/// Actor lifecycle events (created, running, deactivating, destroyed).
#[macro_export]
macro_rules! log_lifecycle {
    ($actor_type:expr, $actor_id:expr, $event:expr) => {
        tracing::debug!(actor_type = $actor_type, actor_id = %$actor_id, event = $event);
    };
    ($actor_type:expr, $actor_id:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(actor_type = $actor_type, actor_id = %$actor_id, event = $event, $($fields)*);
    };
}

/// Pool, broker and scheduler events.
#[macro_export]
macro_rules! log_scheduler {
    ($scheduler:expr, $event:expr) => {
        tracing::debug!(scheduler = $scheduler, event = $event);
    };
    ($scheduler:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(scheduler = $scheduler, event = $event, $($fields)*);
    };
}

/// Admission and drain decisions of a pipeline.
#[macro_export]
macro_rules! log_flow {
    ($pipeline:expr, $event:expr) => {
        tracing::debug!(pipeline = %$pipeline, event = $event);
    };
    ($pipeline:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(pipeline = %$pipeline, event = $event, $($fields)*);
    };
}

/// The current dispatcher, for threads that should log like the caller.
#[inline]
pub fn current_subscriber() -> tracing::Dispatch {
    tracing::dispatcher::get_default(|d| d.clone())
}

pub use tracing::{debug, error, info, trace, warn};
