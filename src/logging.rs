//! `log`-crate facade installation.
//!
//! The core never picks a backend: every module logs through `log`'s
//! macros. This is the one place a `log::Log` implementation is
//! installed, multiplexing between stderr (foreground/debug) and
//! `syslog` (daemonized).

use log::{LevelFilter, Log, Metadata, Record};

enum Sink {
    Stderr,
    Syslog(std::sync::Mutex<syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>>),
}

struct Facade {
    sink: Sink,
    level: LevelFilter,
}

impl Log for Facade {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match &self.sink {
            Sink::Stderr => {
                eprintln!("{} {} {}", record.level(), record.target(), record.args());
            }
            Sink::Syslog(logger) => {
                if let Ok(mut logger) = logger.lock() {
                    let _ = match record.level() {
                        log::Level::Error => logger.err(record.args().to_string()),
                        log::Level::Warn => logger.warning(record.args().to_string()),
                        log::Level::Info => logger.info(record.args().to_string()),
                        log::Level::Debug | log::Level::Trace => logger.debug(record.args().to_string()),
                    };
                }
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the process-wide logger. `foreground` picks stderr (and is
/// implied by `debug`); otherwise `syslog` is used, matching the
/// original's default when run as a daemon. Must be called at most once
/// per process — a second call is a programming error in `main.rs`, not
/// a condition the library guards against at the API boundary.
pub fn init(foreground: bool, debug: bool) {
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };

    let sink = if foreground {
        Sink::Stderr
    } else {
        match syslog::unix(syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: "aoe-targetd".to_string(),
            pid: std::process::id(),
        }) {
            Ok(logger) => Sink::Syslog(std::sync::Mutex::new(logger)),
            Err(_) => Sink::Stderr,
        }
    };

    let facade = Facade { sink, level };
    log::set_max_level(level);
    let _ = log::set_boxed_logger(Box::new(facade));
}
