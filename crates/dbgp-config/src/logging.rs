use std::{
    path::PathBuf,
    sync::{Arc, Mutex, Once},
};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    filter::LevelFilter, fmt::MakeWriter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
    Layer,
};

static TRACING_INIT: Once = Once::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive
    /// string such as `info,dbgp.wire=trace`.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,

    /// Append logs to the given file in addition to stderr.
    ///
    /// If the file cannot be opened, file logging is disabled and stderr
    /// logging continues.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Prefix of every target this workspace logs under (`dbgp.session`,
/// `dbgp.wire`, `dbgp.config`).
const ENGINE_TARGETS: &str = "dbgp";

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    /// Directive string for this configuration.
    ///
    /// A bare level applies to the engine's own targets while dependencies
    /// stay at `warn` or quieter; anything else is used verbatim. `rust_log`
    /// goes last so it can refine individual targets.
    fn directives(&self, rust_log: Option<&str>) -> String {
        let level = match self.level.trim() {
            "" => "info",
            level if level.eq_ignore_ascii_case("warning") => "warn",
            level => level,
        };
        let mut directives = match level.parse::<LevelFilter>() {
            Ok(filter) => format!(
                "{},{ENGINE_TARGETS}={filter}",
                filter.min(LevelFilter::WARN)
            ),
            Err(_) => level.to_owned(),
        };
        if let Some(extra) = rust_log.map(str::trim).filter(|extra| !extra.is_empty()) {
            directives.push(',');
            directives.push_str(extra);
        }
        directives
    }

    /// Effective filter, including `RUST_LOG`. Unparsable directives fall
    /// back to `info` for the engine's targets.
    pub fn env_filter(&self) -> EnvFilter {
        let rust_log = std::env::var("RUST_LOG").ok();
        EnvFilter::try_new(self.directives(rust_log.as_deref()))
            .unwrap_or_else(|_| EnvFilter::new(format!("warn,{ENGINE_TARGETS}=info")))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            file: None,
        }
    }
}

#[derive(Clone)]
struct FileWriter(Arc<Mutex<std::fs::File>>);

struct FileGuard<'a>(std::sync::MutexGuard<'a, std::fs::File>);

impl std::io::Write for FileGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for FileWriter {
    type Writer = FileGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = self.0.lock().unwrap_or_else(|poison| poison.into_inner());
        FileGuard(guard)
    }
}

/// Install the global subscriber once per process.
///
/// Logs always go to stderr: stdout carries the tool protocol. Later calls
/// are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let file = config
            .file
            .as_ref()
            .and_then(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(|file| FileWriter(Arc::new(Mutex::new(file))));
        let file_requested = config.file.is_some();
        let file_opened = file.is_some();

        let stderr_layer = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        };

        let file_layer = file.map(|writer| {
            if config.json {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed()
            }
        });

        let _ = tracing_subscriber::registry()
            .with(config.env_filter())
            .with(stderr_layer)
            .with(file_layer)
            .try_init();

        if file_requested && !file_opened {
            tracing::warn!(
                target = "dbgp.config",
                path = ?config.file,
                "failed to open log file; logging to stderr only"
            );
        }
    });
}
