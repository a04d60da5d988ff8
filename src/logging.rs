//! Structured logging utilities for Kiln
//!
//! Diagnostics go to stderr through `tracing`; task output is written to
//! stdout by the run module and never passes through the subscriber.
//!
//! # Log Format Conventions
//!
//! - `task`: Task identifier (`package#task`)
//! - `hash`: Task hash (hex-encoded)
//! - `operation`: The operation being performed (e.g., "fetch", "put")
//! - `status`: The result status ("hit", "miss", "error")
//! - `source`: Cache layer ("local", "remote")
//! - `size_bytes`: Size in bytes
//!
//! # Examples
//!
//! ```rust,ignore
//! use tracing::info;
//!
//! info!(
//!     task = %task_id,
//!     hash = %hash,
//!     operation = "fetch",
//!     status = "hit",
//!     source = "remote",
//!     "cache hit"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Custom formatter that shows "kiln" instead of full module path
struct KilnFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for KilnFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m", // Red
                tracing::Level::WARN => "\x1b[33m",  // Yellow
                tracing::Level::INFO => "\x1b[32m",  // Green
                tracing::Level::DEBUG => "\x1b[34m", // Blue
                tracing::Level::TRACE => "\x1b[35m", // Magenta
            };
            write!(writer, "{}{:5}(kiln)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(kiln): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors (default for development)
    Pretty,
    /// Same layout without colors (for CI)
    Compact,
    /// JSON format (for log aggregation systems)
    Json,
}

impl LogFormat {
    /// Parse a format name, falling back to environment detection
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }

    /// Resolve the format: `KILN_LOG_FORMAT`, then `configured`, then CI detection
    pub fn resolve(configured: Option<Self>) -> Self {
        std::env::var("KILN_LOG_FORMAT")
            .ok()
            .and_then(|value| Self::parse(&value))
            .or(configured)
            .unwrap_or_else(|| {
                if std::env::var("CI").is_ok() {
                    Self::Compact
                } else {
                    Self::Pretty
                }
            })
    }
}

/// Initialize the global tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "debug", "kiln=trace"); wins over `default_level`
/// - `KILN_LOG_FORMAT`: Set format ("pretty", "compact", "json")
/// - `CI`: If set, defaults to compact format
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init(default_level: &str, configured_format: Option<LogFormat>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let result = match LogFormat::resolve(configured_format) {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(KilnFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(KilnFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("kiln: logging already initialized: {}", e);
    }
}

/// Operation names for consistent logging
pub mod operations {
    pub const FETCH: &str = "fetch";
    pub const PUT: &str = "put";
    pub const EXISTS: &str = "exists";
    pub const RESTORE: &str = "restore";
    pub const EXECUTE: &str = "execute";
}

/// Status values for consistent logging
pub mod status {
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const SKIPPED: &str = "skipped";
}
