// Logger backend for the log facade. Informational lines are part of the
// tool's contract with the wrapping CLI (it looks for "no changed
// functions" on stdout), so Info goes to stdout and everything else to
// stderr, each line prefixed with the source object's basename so a build
// log can be attributed to its inputs.

use log::{set_logger, set_max_level, Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;
use std::sync::OnceLock;

/* set_boxed_logger would also work here, but the logger carries no state
besides its level, so static instances selected at init keep it simple. */

static INFO_LOGGER: PrefixLogger = PrefixLogger::new(LevelFilter::Info);
static DEBUG_LOGGER: PrefixLogger = PrefixLogger::new(LevelFilter::Debug);
static LOG_PREFIX: OnceLock<String> = OnceLock::new();

pub struct PrefixLogger {
    level: LevelFilter,
}

impl PrefixLogger {
    pub const fn new(level: LevelFilter) -> Self {
        PrefixLogger { level }
    }

    pub fn init(debug: bool, prefix: String) -> Result<(), SetLoggerError> {
        let _ = LOG_PREFIX.set(prefix);
        let level = if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        set_max_level(level);
        let logger: &'static dyn Log = if debug { &DEBUG_LOGGER } else { &INFO_LOGGER };
        set_logger(logger)
    }
}

fn prefix() -> &'static str {
    LOG_PREFIX
        .get()
        .map(String::as_str)
        .unwrap_or("object-patching")
}

impl Log for PrefixLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if record.level() == Level::Info {
            println!("{}: {}", prefix(), record.args());
        } else {
            eprintln!("{}: {} -- {}", prefix(), record.level(), record.args());
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }
}
