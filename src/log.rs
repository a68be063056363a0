//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for
//! details.
//!
//! The runtime itself logs through the `log` facade with target `"system"`;
//! [`SystemLogger`] is the bundled backend that renders those records to
//! stderr enriched with the emitting thread and fiber. Installing it is
//! optional — any other `log::Log` implementation works just as well.
//!
//! ```no_run
//! filament::log::init(log::LevelFilter::Debug);
//! log::info!(target: "system", "runtime starting");
//! ```

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

use crate::thread;
use crate::util;

/// [`Log`] implementation writing one line per record to stderr:
/// `timestamp level target [thread:tid] [fiber:id] file:line message`.
///
/// Emission never blocks on runtime locks and never yields, so it is safe
/// to log from inside any fiber, timer callback or bare thread.
pub struct SystemLogger {
    level: LevelFilter,
}

impl SystemLogger {
    #[inline]
    pub const fn new(level: LevelFilter) -> Self {
        SystemLogger { level }
    }
}

impl Log for SystemLogger {
    #[inline]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!(
            "{} {:<5} {} [{}:{}] [fiber:{}] {}:{} {}\n",
            now,
            record.level(),
            record.target(),
            thread::current_name(),
            util::thread_id(),
            util::fiber_id(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args(),
        );
        // Single write keeps concurrent records from interleaving.
        let _ = std::io::stderr().write_all(line.as_bytes());
    }

    #[inline]
    fn flush(&self) {}
}

static LOGGER: OnceCell<SystemLogger> = OnceCell::new();

/// Installs the [`SystemLogger`] as the process-wide `log` backend.
///
/// Idempotent; does nothing if any logger (this one or another) has already
/// been installed.
pub fn init(level: LevelFilter) {
    let logger = LOGGER.get_or_init(|| SystemLogger::new(level));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
