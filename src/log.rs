//! This module provides leveled logging to the terminal. Errors and
//! warnings always print; info and debug lines only show up when the
//! SSI_DEBUG or STYL_DEBUG environment variable is set, the knobs
//! scanner users already know.
use chrono::Local;
use std::env;

#[derive(PartialOrd, PartialEq)]
pub enum Level {
    Error,
    Warning,
    Info,
    Debug,
}

impl Level {
    fn tag(&self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warning => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

/// The verbosity ceiling. Re-read from the environment on every call the
/// way the C tools did it, so a wrapper script can flip it per run.
fn ceiling() -> Level {
    if env::var("SSI_DEBUG").is_ok() || env::var("STYL_DEBUG").is_ok() {
        Level::Debug
    } else {
        Level::Warning
    }
}

pub fn log(level: &Level, s: &str) {
    let dt = Local::now().to_rfc3339();
    let line = format!("[{}] [{}] {}", dt, level.tag(), s);
    match level {
        Level::Error | Level::Warning => eprintln!("{}", line),
        _ => println!("{}", line),
    }
}

pub fn debug(s: &str) {
    if Level::Debug <= ceiling() {
        log(&Level::Debug, s);
    }
}

pub fn info(s: &str) {
    if Level::Info <= ceiling() {
        log(&Level::Info, s);
    }
}

pub fn warn(s: &str) {
    if Level::Warning <= ceiling() {
        log(&Level::Warning, s);
    }
}

pub fn error(s: &str) {
    if Level::Error <= ceiling() {
        log(&Level::Error, s);
    }
}

/// Render a frame as hex at debug level, one line per frame.
pub fn dump_frame(label: &str, frame: &[u8]) {
    if Level::Debug > ceiling() {
        return;
    }
    let mut line = String::with_capacity(frame.len() * 5);
    for b in frame.iter() {
        line.push_str(&format!("0x{:02x} ", b));
    }
    log(&Level::Debug, &format!("{}: {}", label, line.trim_end()));
}
