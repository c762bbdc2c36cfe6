//! Diagnostic logging for the coordinator.
//!
//! Diagnostics go to stderr (and optionally a file); results go to stdout.
//! Process workers do not use this: their stderr is their `.err` sink.
//!
//! Environment, consulted by [`LogConfig::with_env_overrides`]:
//!
//! - `MXPOOL_LOG` - filter directives, e.g. `mxpool::worker=trace`
//! - `RUST_LOG` - fallback when `MXPOOL_LOG` is unset
//! - `MXPOOL_LOG_LEVEL` - base level when no filter is given
//! - `MXPOOL_LOG_FORMAT` - `pretty`, `compact` or `json`
//! - `MXPOOL_LOG_FILE` - also append diagnostics to this file
//!
//! ```no_run
//! use mxpool::logging::{LogConfig, init};
//!
//! init(LogConfig::for_cli().with_env_overrides());
//! ```

use clap::ValueEnum;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::LevelFilter,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// How each diagnostic event is laid out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Multi-line, human oriented
    #[default]
    #[value(alias = "full")]
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Subscriber settings. Build with the `with_*` methods, then [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Used when no filter directive is set
    pub default_level: Level,
    pub format: LogFormat,
    /// `EnvFilter` directives; a bare level name works too
    pub filter: Option<String>,
    pub file: Option<PathBuf>,
    /// Emit an event with timings when each span closes
    pub span_events: bool,
    pub show_target: bool,
    pub show_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            format: LogFormat::Pretty,
            filter: None,
            file: None,
            span_events: false,
            show_target: true,
            show_thread_names: false,
        }
    }
}

impl LogConfig {
    /// Command-line preset: warnings and errors, one line each. Thread
    /// names identify thread-backend workers.
    pub fn for_cli() -> Self {
        Self {
            default_level: Level::WARN,
            format: LogFormat::Compact,
            show_target: false,
            show_thread_names: true,
            ..Self::default()
        }
    }

    pub fn with_default_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, directives: impl Into<String>) -> Self {
        self.filter = Some(directives.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Fill in settings from the environment.
    ///
    /// A filter that is already set wins over `MXPOOL_LOG`, `RUST_LOG` and
    /// `MXPOOL_LOG_LEVEL`. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if self.filter.is_none() {
            self.filter = var("MXPOOL_LOG").or_else(|| var("RUST_LOG"));
        }
        if self.filter.is_none()
            && let Some(level) = var("MXPOOL_LOG_LEVEL").and_then(|v| v.parse().ok())
        {
            self.default_level = level;
        }
        if let Some(format) =
            var("MXPOOL_LOG_FORMAT").and_then(|v| LogFormat::from_str(&v, true).ok())
        {
            self.format = format;
        }
        if let Some(path) = var("MXPOOL_LOG_FILE") {
            self.file = Some(PathBuf::from(path));
        }
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback =
            EnvFilter::default().add_directive(LevelFilter::from_level(self.default_level).into());
        let Some(directives) = &self.filter else {
            return fallback;
        };
        EnvFilter::try_new(directives).unwrap_or_else(|e| {
            eprintln!("mxpool: ignoring log filter '{}': {}", directives, e);
            fallback
        })
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// A formatting layer writing to `writer` in the configured format.
fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.show_target)
        .with_thread_names(config.show_thread_names)
        .with_span_events(config.span_events());

    match config.format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Json => base.json().boxed(),
    }
}

/// Install the global subscriber: stderr, plus `config.file` when set.
///
/// Stderr gets ANSI colour only when it is a terminal. Only the first call
/// in a process has any effect.
pub fn init(config: LogConfig) {
    let ansi = std::io::stderr().is_terminal();
    let mut layers = vec![fmt_layer(&config, std::io::stderr, ansi)];
    if let Some(path) = &config.file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let name = path.file_name().unwrap_or("mxpool.log".as_ref());
        layers.push(fmt_layer(
            &config,
            tracing_appender::rolling::never(dir, name),
            false,
        ));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter())
        .try_init();
}
