//! Logging setup: `tracing` subscriber assembly and the host logger bridge.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig};

const LOG_FILE_PREFIX: &str = "wsrepl.log";

/// A structured log event delivered to a host-installed logger.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub level: Level,
    pub target: &'static str,
    pub message: Option<String>,
    pub fields: BTreeMap<String, String>,
}

/// Host sink receiving every log event in addition to the configured layers.
pub trait Logger: Send + Sync {
    fn log(&self, record: LogRecord);
}

#[derive(Clone)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
    pub logger: Option<Arc<dyn Logger>>,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self {
            verbosity,
            logging,
            logger: None,
        }
    }
}

pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Installs the global subscriber. Call once per process.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let default = level_from_verbosity(config.verbosity);
    let filter = match &config.logging.filter {
        Some(directives) => EnvFilter::try_new(directives)
            .unwrap_or_else(|_| EnvFilter::default().add_directive(default.into())),
        None => EnvFilter::builder()
            .with_default_directive(default.into())
            .with_env_var("LOG")
            .from_env_lossy(),
    };

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.logging.stdout {
        layers.push(build_stdout_layer(config.logging.stdout_format));
    }

    let mut file_setup_error = None;
    if config.logging.file.enabled {
        let dir = resolve_log_dir(&config.logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let (layer, guard) = build_file_layer(&config.logging.file, &dir);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error =
                    Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    if let Some(logger) = config.logger {
        layers.push(Box::new(LoggerLayer { logger }));
    }

    layers.push(Box::new(filter));

    Registry::default().with(layers).init();

    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record(field, value.to_string());
    }
}

struct LoggerLayer {
    logger: Arc<dyn Logger>,
}

impl<S> Layer<S> for LoggerLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.logger.log(LogRecord {
            timestamp: SystemTime::now(),
            level: *event.metadata().level(),
            target: event.metadata().target(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

fn build_stdout_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Tree => Box::new(tracing_tree::HierarchicalLayer::new(2)),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
    }
}

fn build_file_layer(
    config: &FileLoggingConfig,
    dir: &std::path::Path,
) -> (
    Box<dyn Layer<Registry> + Send + Sync>,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let appender = tracing_appender::rolling::RollingFileAppender::new(
        tracing_appender::rolling::Rotation::DAILY,
        dir,
        LOG_FILE_PREFIX,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(false)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true),
        ),
    };
    (layer, guard)
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config.dir.clone().unwrap_or_else(|| PathBuf::from("."))
}
