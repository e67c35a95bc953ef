//! Logging configuration for Strata
//!
//! The engine logs through `tracing`; nothing is printed until the
//! application installs a subscriber. [`LogConfig`] installs one with an
//! `EnvFilter` (so `RUST_LOG` overrides the configured level) and optional
//! daily-rolling file output.

use std::path::{Path, PathBuf};
use strata_core::{Error, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    /// Output to stdout
    Stdout,
    /// Output to a daily-rolling file
    File(PathBuf),
    /// Output to both stdout and file
    Both(PathBuf),
}

/// Log format style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable format
    Pretty,
    /// Compact single-line format
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level or filter directive, e.g. `info` or `strata_storage=debug`
    pub level: String,
    /// Output destination
    pub output: LogOutput,
    /// Format style
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stdout,
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    /// Info level to stdout
    pub fn info() -> Self {
        Self::default()
    }

    /// Debug level to stdout; shows per-file flush and compaction detail
    pub fn debug() -> Self {
        Self::default().with_level("debug")
    }

    /// Warn level to stdout; only write stalls and skipped corruption
    pub fn warn() -> Self {
        Self::default().with_level("warn")
    }

    /// Send output to a daily-rolling file
    pub fn with_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.into());
        self
    }

    /// Send output to stdout and a daily-rolling file
    pub fn with_both<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::Both(path.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level<S: Into<String>>(mut self, level: S) -> Self {
        self.level = level.into();
        self
    }

    /// The filter this configuration installs, unless `RUST_LOG` is set.
    pub fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.level)
            .map_err(|e| Error::InvalidArgument(format!("log level {:?}: {}", self.level, e)))
    }

    /// Install the global subscriber.
    ///
    /// Returns the file writer's guard when logging to a file; keep it alive
    /// for as long as logs should be flushed. Fails if the level does not
    /// parse or a global subscriber is already installed.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use strata::logging::LogConfig;
    ///
    /// let _guard = LogConfig::info().with_file("./logs/strata.log").init()?;
    /// # Ok::<(), strata::Error>(())
    /// ```
    pub fn init(self) -> Result<Option<WorkerGuard>> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => self.filter()?,
        };

        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;
        if matches!(self.output, LogOutput::Stdout | LogOutput::Both(_)) {
            layers.push(self.styled(fmt::layer()));
        }
        if let LogOutput::File(path) | LogOutput::Both(path) = &self.output {
            let (dir, file) = split_log_path(path);
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, worker) = tracing_appender::non_blocking(appender);
            layers.push(self.styled(fmt::layer().with_writer(writer).with_ansi(false)));
            guard = Some(worker);
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(env_filter)
            .try_init()
            .map_err(|e| Error::InvalidArgument(format!("logging already initialised: {}", e)))?;
        Ok(guard)
    }

    fn styled<W>(
        &self,
        layer: fmt::Layer<Registry, fmt::format::DefaultFields, fmt::format::Format, W>,
    ) -> BoxedLayer
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        match self.format {
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
        }
    }
}

/// Directory and file name prefix for the rolling appender
fn split_log_path(path: &Path) -> (&Path, &str) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("strata.log");
    (dir, file)
}
