//! Minimal stderr backend for the `log` facade.
//!
//! Lines look like `[    0.012] DEBUG [scheduler] starting task ...`: seconds
//! since `init`, level, and the last segment of the module path.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

struct StderrLogger {
    start: Instant,
}

static LOGGER: OnceLock<StderrLogger> = OnceLock::new();

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = self.start.elapsed();
        let module = record.module_path().unwrap_or("?");
        let module = module.rsplit("::").next().unwrap_or(module);
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        // a failed diagnostic write has nowhere better to go
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{:5}.{:03}] {} [{}] {}",
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            level,
            module,
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the stderr logger at `level`. Later calls only change the level.
pub fn init(level: LevelFilter) {
    let logger = LOGGER.get_or_init(|| StderrLogger {
        start: Instant::now(),
    });
    // already installed (by us or by the host program) is fine
    let _ = log::set_logger(logger);
    log::set_max_level(level);
}

/// Level from `JMPSCHED_LOG` (`off`, `error` .. `trace`), default `warn`.
pub fn init_from_env() {
    init(level_from(std::env::var("JMPSCHED_LOG").ok().as_deref()));
}

fn level_from(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(LevelFilter::Warn)
}
