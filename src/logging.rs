//! Logging setup on top of tracing-subscriber
//!
//! One registry, up to two layers: a console layer (stdout, or stderr for the
//! `worker` subcommand whose stdout carries protocol lines) and an optional
//! daily-rotated file layer written through a non-blocking appender.
//! `RUST_LOG` still wins for individual targets.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Targets held at `warn` regardless of the chosen level
const NOISY_TARGETS: [&str; 2] = ["tokio_tungstenite", "tungstenite"];

/// Console destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    Stdout,
    Stderr,
}

impl Console {
    fn writer(self) -> BoxMakeWriter {
        match self {
            Console::Stdout => BoxMakeWriter::new(std::io::stdout),
            Console::Stderr => BoxMakeWriter::new(std::io::stderr),
        }
    }
}

/// Keeps the file writer thread alive; dropping it flushes buffered lines
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber
///
/// `-q` forces `error`, each `-v` lowers the floor one step below the
/// configured level (`-v` debug, `-vv` trace). Fails if a subscriber is
/// already installed.
pub fn init_logging(
    settings: &LoggingSettings,
    verbose: u8,
    quiet: bool,
    console: Console,
) -> Result<LogGuards> {
    let level = effective_level(&settings.level, verbose, quiet);

    let mut file_guard = None;
    let file_output = match settings.file.as_deref() {
        Some(path) => {
            let (layer, guard) = file_layer(Path::new(path), settings.max_files, settings.json_format)?;
            file_guard = Some(guard);
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(level)?)
        .with(console_layer(settings.json_format, console))
        .with(file_output)
        .try_init()
        .map_err(|e| Error::Internal(format!("logging already initialized: {}", e)))?;

    tracing::debug!(%level, file = ?settings.file, json = settings.json_format, "Logging ready");

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

/// Plain stderr output for short commands that never load a config file
pub fn init_simple(level: Level) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .with(console_layer(false, Console::Stderr))
        .try_init()
        .map_err(|e| Error::Internal(format!("logging already initialized: {}", e)))
}

fn effective_level(configured: &str, verbose: u8, quiet: bool) -> Level {
    match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::from_str(configured).unwrap_or(Level::INFO),
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    }
}

fn env_filter(level: Level) -> Result<EnvFilter> {
    let level = level.to_string().to_lowercase();
    let mut directives = vec![format!("syncdeck={}", level)];
    directives.extend(NOISY_TARGETS.iter().map(|target| format!("{}=warn", target)));

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    for directive in directives {
        let parsed = directive
            .parse::<Directive>()
            .map_err(|e| Error::Internal(format!("bad log directive {}: {}", directive, e)))?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

fn console_layer<S>(json: bool, console: Console) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let base = fmt::layer().with_writer(console.writer()).with_target(true);
    if json {
        base.json().with_span_events(FmtSpan::CLOSE).boxed()
    } else {
        // Colors only on a terminal-facing stdout; stderr may be a captured pipe
        base.with_ansi(console == Console::Stdout).compact().boxed()
    }
}

/// `dir/name.log` rotates daily into `dir/name.YYYY-MM-DD.log`
fn file_layer<S>(path: &Path, max_files: u32, json: bool) -> Result<(BoxedLayer<S>, WorkerGuard)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(directory).map_err(|source| Error::IoWrite {
        path: directory.to_path_buf(),
        source,
    })?;

    let prefix = path.file_stem().and_then(|s| s.to_str()).unwrap_or("syncdeck");
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| Error::Internal(format!("cannot open log file in {}: {}", directory.display(), e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);
    let layer = if json {
        base.json().with_file(true).with_line_number(true).boxed()
    } else {
        base.boxed()
    };
    Ok((layer, guard))
}
