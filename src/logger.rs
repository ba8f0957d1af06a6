use conquer_once::spin::OnceCell;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;

/// Environment variable holding the log level (`error` .. `trace`)
pub const LOG_ENV: &str = "AZNIX_LOG";

static LOGGER: OnceCell<StderrLogger> = OnceCell::uninit();

pub struct StderrLogger {
    level: LevelFilter,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // One locked write per record so lines from worker threads don't
        // interleave.
        let mut stderr = std::io::stderr().lock();
        let _ = match record.level() {
            Level::Trace | Level::Debug => writeln!(
                stderr,
                "[{:>5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            ),
            _ => writeln!(stderr, "[{:>5}] {}", record.level(), record.args()),
        };
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn level_from_env() -> LevelFilter {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Install the stderr logger. Later calls keep the first level.
pub fn init(verbose: bool) {
    let logger = LOGGER.get_or_init(|| StderrLogger {
        level: if verbose {
            LevelFilter::Trace
        } else {
            level_from_env()
        },
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.level);
    }
}
