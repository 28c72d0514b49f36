//! Structured logging utilities for rtbuild
//!
//! Every event uses structured fields so build traces can be filtered and
//! aggregated.
//!
//! # Log Format Conventions
//!
//! - `operation`: The operation being performed (e.g., "cache.load", "job.run")
//! - `status`: The result status ("hit", "miss", "stale", "error")
//! - `library`: The native library being built (e.g., "picolibc")
//! - `output_name`: Cache entry name for a library/target combination
//!
//! # Examples
//!
//! ```rust
//! use tracing::info;
//!
//! info!(
//!     operation = "cache.load",
//!     status = "hit",
//!     output_name = "picolibc-arm-none-eabi-1a2b3c4d",
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

/// Formatter that prints "rtbuild" instead of the full module path
struct RtbuildFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for RtbuildFormatter
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
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(rtbuild)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(rtbuild): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors
    Pretty,
    /// Plain format (for CI)
    Compact,
    /// JSON format (for log aggregation systems)
    Json,
}

impl LogFormat {
    /// Parse from environment variable (RTBUILD_LOG_FORMAT)
    pub fn from_env() -> Self {
        Self::parse(
            std::env::var("RTBUILD_LOG_FORMAT").ok().as_deref(),
            std::env::var("CI").is_ok(),
        )
    }

    fn parse(value: Option<&str>, ci: bool) -> Self {
        match value.unwrap_or_default().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ if ci => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Initialize the global tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "debug", "info", "warn")
/// - `RTBUILD_LOG_FORMAT`: Set format ("pretty", "compact", "json")
/// - `CI`: If set, defaults to compact format
///
/// Panics if a global subscriber has already been installed; use
/// [`try_init`] from code that may run more than once.
pub fn init() {
    if let Err(e) = try_init() {
        panic!("failed to install tracing subscriber: {e}");
    }
}

/// Like [`init`], but reports an already-installed subscriber as an error.
pub fn try_init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    match LogFormat::from_env() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(RtbuildFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init()?,
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(RtbuildFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init()?,
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
            .try_init()?,
    }

    Ok(())
}

/// Standard field names for consistent logging
#[allow(dead_code)]
pub mod fields {
    pub const OPERATION: &str = "operation";
    pub const STATUS: &str = "status";
    pub const LIBRARY: &str = "library";
    pub const OUTPUT_NAME: &str = "output_name";
    pub const PATH: &str = "path";
    /// Number of jobs (for scheduler summaries)
    pub const JOB_COUNT: &str = "job_count";
}

/// Operation names for consistent logging
pub mod operations {
    pub const CACHE_LOAD: &str = "cache.load";
    pub const CACHE_STORE: &str = "cache.store";
    pub const CACHE_REMOVE: &str = "cache.remove";
    pub const JOB_RUN: &str = "job.run";
    pub const GRAPH_RUN: &str = "graph.run";
    pub const LIBRARY_LOAD: &str = "library.load";
}

/// Status values for consistent logging
pub mod status {
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const STALE: &str = "stale";
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const PRECOMPILED: &str = "precompiled";
}
