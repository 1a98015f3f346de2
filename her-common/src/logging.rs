//! Logging setup for the her services.
//!
//! Console output is always enabled; a rolling log file under
//! `observability.log_dir` is added when `log_to_file` is set.
//!
//! # Noise Filtering
//!
//! Noisy library modules (hyper, reqwest, h2, rustls, redis...) are set to
//! `warn` so business logs stay readable at `info`/`debug`. `RUST_LOG`
//! overrides the whole filter.

use crate::config::ObservabilityConfig;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// Default noisy modules that should be filtered to warn level.
pub const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "tokio_util",
    "tower_http",
    "redis",
];

/// Base name of rotated log files.
pub const LOG_FILE_PREFIX: &str = "her_server";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Parse a format name; anything other than `json` means pretty.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Build the filter directive string with noise suppression.
fn filter_directives(log_level: &str) -> String {
    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{}=warn", module));
    }
    directives
}

fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(log_level)))
}

fn fmt_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);

    match format {
        LogFormat::Json => layer
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Pretty => layer.with_file(false).with_line_number(false).boxed(),
    }
}

fn file_appender(config: &ObservabilityConfig) -> Option<RollingFileAppender> {
    if !config.log_to_file {
        return None;
    }

    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!(
            "cannot create log directory {}: {e}; file logging disabled",
            config.log_dir.display()
        );
        return None;
    }

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(config.backup_count.max(1))
        .build(&config.log_dir)
        .map_err(|e| eprintln!("cannot open log file: {e}; file logging disabled"))
        .ok()
}

/// Initialize logging from the observability configuration.
///
/// Returns the guard of the background file writer; keep it alive for the
/// life of the process or buffered lines are lost on exit.
pub fn init_logging(config: &ObservabilityConfig) -> Option<WorkerGuard> {
    let format = LogFormat::parse(&config.log_format);

    let (file_writer, guard) = match file_appender(config) {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    let file_layer = file_writer.map(|writer| fmt_layer(format, writer, false));

    let _ = tracing_subscriber::registry()
        .with(build_filter(&config.log_level))
        .with(fmt_layer(format, std::io::stdout, true))
        .with(file_layer)
        .try_init();

    tracing::info!(
        log_level = %config.log_level,
        log_format = %config.log_format,
        log_to_file = guard.is_some(),
        noise_filtered = NOISY_MODULES.len(),
        "Logging initialized"
    );

    guard
}

/// Generate a new trace ID for request tracing.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Create a tracing span for an HTTP request with business context.
///
/// # Example
///
/// ```ignore
/// let span = request_span!("submit_turn", trace_id, session_id = %session_id);
/// handler_future.instrument(span).await
/// ```
#[macro_export]
macro_rules! request_span {
    ($name:expr, $trace_id:expr) => {
        tracing::info_span!($name, trace_id = %$trace_id)
    };
    ($name:expr, $trace_id:expr, $($field:tt)*) => {
        tracing::info_span!($name, trace_id = %$trace_id, $($field)*)
    };
}
