//! Logging Module
//!
//! The library only emits `tracing` events; the binary installs the subscriber
//! through [`init_logging`]. Our own modules log at the chosen level while the
//! framework and download crates are held at `warn` so batch-level debug output
//! stays readable. `RUST_LOG`, when set, replaces the computed filter.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

/// Crates that are noisy at debug level and only report warnings
pub const QUIET_TARGETS: &[&str] = &["burn", "cubecl", "wgpu_core", "wgpu_hal", "naga", "hf_hub", "ureq", "rustls"];

/// Minimum level for this crate's events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Parse a `--log-level` value
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!(
                "unknown log level '{}' (expected error, warn, info, debug or trace)",
                other
            )),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::parse(s)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscriber settings chosen by the CLI
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Let [`QUIET_TARGETS`] log at `level` too
    pub show_dependencies: bool,
    /// Show module targets and thread ids (the prefetch worker runs on its own thread)
    pub detailed: bool,
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_dependencies: false,
            detailed: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Settings for the `--verbose` / `--quiet` / `--log-level` flags
    ///
    /// An explicit level wins over the two shorthands.
    pub fn from_flags(verbose: bool, quiet: bool, level: Option<LogLevel>) -> Self {
        let level = match (level, verbose, quiet) {
            (Some(level), _, _) => level,
            (None, true, _) => LogLevel::Debug,
            (None, false, true) => LogLevel::Error,
            (None, false, false) => LogLevel::Info,
        };
        Self {
            level,
            detailed: level >= LogLevel::Debug,
            ..Self::default()
        }
    }

    /// Filter directives: `level` globally, `warn` for quiet targets
    pub fn directives(&self) -> String {
        let mut directives = vec![self.level.as_str().to_string()];
        if !self.show_dependencies && self.level > LogLevel::Warn {
            directives.extend(QUIET_TARGETS.iter().map(|target| format!("{}=warn", target)));
        }
        directives.join(",")
    }
}

/// Install the global subscriber; fails if one is already installed
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    tracing_subscriber::registry()
        .with(
            tracing_fmt::layer()
                .compact()
                .with_ansi(config.ansi_colors)
                .with_target(config.detailed)
                .with_thread_ids(config.detailed),
        )
        .with(filter)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {e}"))
}
