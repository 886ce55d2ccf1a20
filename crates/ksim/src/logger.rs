//! Host-side sink for the kernel's `log` output.
//!
//! Same line layout as the kernel console: a coloured `[LEVEL]` tag, then
//! the message. Written to stderr so the test harness captures it.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Environment variable holding the maximum level, e.g. `KSIM_LOG=trace`.
pub const LEVEL_VARIABLE: &str = "KSIM_LOG";

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

fn tag(level: Level) -> &'static str {
    match level {
        Level::Trace => "TRACE",
        Level::Debug => "DEBUG",
        Level::Info => " INFO",
        Level::Warn => " WARN",
        Level::Error => "ERROR",
    }
}

fn color(level: Level) -> &'static str {
    match level {
        Level::Trace => "\x1b[90m", // Gray
        Level::Debug => "\x1b[36m", // Cyan
        Level::Info => "\x1b[32m",  // Green
        Level::Warn => "\x1b[33m",  // Yellow
        Level::Error => "\x1b[31m", // Red
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        // eprintln! goes through the test harness's output capture.
        eprintln!("{}[{}]\x1b[0m {}", color(level), tag(level), record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Installs the logger once; later calls are ignored.
pub fn init() {
    let level = std::env::var(LEVEL_VARIABLE)
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
