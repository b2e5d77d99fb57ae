//! Logging setup
//!
//! One console layer on stderr and an optional rolling file layer, both
//! fed through the same `EnvFilter`. Stdout stays free for command output.
//! `RUST_LOG` sets the baseline; the configured level (or `-v`/`-q`)
//! always applies to this crate.

use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Dependencies whose chatter stays at warn unless RUST_LOG says otherwise
const QUIET_TARGETS: &[&str] = &["hyper", "tungstenite", "tokio_tungstenite"];

/// Keeps the file writer flushing until dropped at process exit
pub struct LogGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let level = effective_level(settings, verbose, quiet);
    let filter = build_env_filter(level)?;

    let console = fmt_layer(io::stderr, settings.json_format, Sink::Console);
    let (file, guard) = match settings.file.as_deref() {
        Some(path) => {
            let (layer, guard) =
                build_file_layer(path, settings.max_file_size_mb, settings.max_files, settings.json_format)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Config(format!("Logging already initialized: {}", e)))?;

    tracing::debug!(level = %level, file = ?settings.file, json = settings.json_format, "Logging ready");

    Ok(LogGuards { _file: guard })
}

/// `-q` beats `-v`, and either beats the configured level
fn effective_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::from_str(&settings.level).unwrap_or(Level::INFO),
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    }
}

fn build_env_filter(level: Level) -> Result<EnvFilter> {
    let base = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let own = format!("{}={}", env!("CARGO_CRATE_NAME"), level);
    let mut directives =
        std::iter::once(own).chain(QUIET_TARGETS.iter().map(|t| format!("{}=warn", t)));

    directives.try_fold(base, |filter, directive| {
        let parsed = directive
            .parse()
            .map_err(|e| Error::Config(format!("Bad log directive '{}': {}", directive, e)))?;
        Ok(filter.add_directive(parsed))
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Sink {
    Console,
    File,
}

/// Formatting layer for either sink. Files get source locations and no ANSI.
fn fmt_layer<S, W>(writer: W, json: bool, sink: Sink) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let to_file = sink == Sink::File;
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_file(to_file)
        .with_line_number(to_file);

    if json {
        layer
            .json()
            .with_current_span(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else if to_file {
        layer.with_ansi(false).with_thread_ids(true).boxed()
    } else {
        layer.compact().boxed()
    }
}

/// Rolling file layer. Rotation is time based; a small size budget
/// rotates hourly, anything else daily.
fn build_file_layer<S>(
    log_file: &str,
    max_size_mb: u64,
    max_files: u32,
    json: bool,
) -> Result<(BoxedLayer<S>, WorkerGuard)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let path = Path::new(log_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|source| Error::IoWrite {
        path: dir.to_path_buf(),
        source,
    })?;

    let prefix = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("executor");
    let rotation = match max_size_mb {
        1..=9 => Rotation::HOURLY,
        _ => Rotation::DAILY,
    };

    let appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(max_files.max(1) as usize)
        .build(dir)
        .map_err(|e| Error::Config(format!("Cannot open log file {}: {}", log_file, e)))?;

    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((fmt_layer(writer, json, Sink::File), guard))
}
