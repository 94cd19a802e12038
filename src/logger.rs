use std::time::SystemTime;

use log::{Level, LevelFilter};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

pub struct Logger;

static LOGGER: Logger = Logger;

/// Install the console logger. Level comes from `SLIPSERVE_LOG`
/// (`error`..`trace`), defaulting to `info`.
pub fn init() {
    let level = match std::env::var("SLIPSERVE_LOG").as_deref() {
        Ok("trace") => LevelFilter::Trace,
        Ok("debug") => LevelFilter::Debug,
        Ok("warn") => LevelFilter::Warn,
        Ok("error") => LevelFilter::Error,
        _ => LevelFilter::Info,
    };

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

impl log::Log for Logger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let time = humantime::format_rfc3339_seconds(SystemTime::now());

        let dim = Style::new().dimmed().prefix();

        eprintln!(
            "{dim}{time}{RESET} {}{:5}{RESET} {}",
            match record.level() {
                Level::Trace => Color::Purple,
                Level::Debug => Color::Blue,
                Level::Info => Color::Green,
                Level::Warn => Color::Yellow,
                Level::Error => Color::Red,
            }
            .bold()
            .prefix(),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}
