//! A small synchronous logger for the SlitScan engine.
//!
//! Unlike `shadow`'s `ShadowLogger` (a multi-threaded, buffered `log::Log`
//! implementation backed by a dedicated flush thread), this logger runs
//! entirely on the caller's thread: the engine is single-threaded by design
//! (see the engine's concurrency model), so there is nothing to hand off to a
//! background worker, and every write is flushed immediately.

use std::fs::{File, OpenOptions};
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::OnceCell;
use regex::Regex;

static ANSI_RE: OnceCell<Regex> = OnceCell::new();

fn ansi_re() -> &'static Regex {
    ANSI_RE.get_or_init(|| Regex::new(r"\x1b\[[^m]*m").unwrap())
}

/// Strips ANSI color escapes before they're written to the log file.
fn strip_ansi(s: &str) -> std::borrow::Cow<'_, str> {
    ansi_re().replace_all(s, "")
}

fn unix_time_float() -> f64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs() as f64 + f64::from(now.subsec_nanos()) / 1_000_000_000.0
}

/// Logs to stderr (colorized when it's a TTY) and to an append-only file
/// (ANSI-stripped, flushed after every line).
pub struct EngineLogger {
    file: Mutex<File>,
    color_stderr: bool,
    max_level: LevelFilter,
}

impl EngineLogger {
    fn new(file: File, color_stderr: bool, max_level: LevelFilter) -> Self {
        Self {
            file: Mutex::new(file),
            color_stderr,
            max_level,
        }
    }
}

impl Log for EngineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!("{}", record.args());

        let stderr_line = if self.color_stderr {
            format!("{}{}\x1b[0m", color_prefix(record.level()), line)
        } else {
            line.clone()
        };
        eprintln!("[{:.6}] {}", unix_time_float(), stderr_line);

        let stripped = strip_ansi(&line);
        let mut file = self.file.lock().unwrap();
        let _ = writeln!(file, "[{:.6}] {}", unix_time_float(), stripped);
        let _ = file.flush();
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

fn color_prefix(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[1;31m",
        Level::Warn => "\x1b[1;33m",
        Level::Info => "\x1b[0;32m",
        Level::Debug => "\x1b[0;36m",
        Level::Trace => "\x1b[0;37m",
    }
}

/// Initializes the global logger, opening `log_path` in append mode.
///
/// Returns an error if the logger was already initialized or the log file
/// could not be opened (configuration-fatal, per the engine's error
/// taxonomy — the caller should `.context(...)` this and abort startup).
pub fn init(log_path: impl AsRef<Path>, max_level: LevelFilter) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path.as_ref())
        .map_err(|e| anyhow::anyhow!("opening log file {:?}: {e}", log_path.as_ref()))?;

    let color_stderr = std::io::stderr().is_terminal();
    let logger = EngineLogger::new(file, color_stderr, max_level);

    log::set_boxed_logger(Box::new(logger))
        .map_err(|e: SetLoggerError| anyhow::anyhow!("logger already initialized: {e}"))?;
    log::set_max_level(max_level);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_sequences() {
        let input = "\x1b[1;45m()\x1b[0m\x1b[1;35mDiscovered tunnel\x1b[0m";
        assert_eq!(strip_ansi(input), "()Discovered tunnel");
    }

    #[test]
    fn leaves_plain_text_untouched() {
        assert_eq!(strip_ansi("plain text, no escapes"), "plain text, no escapes");
    }

    #[test]
    fn timestamp_is_monotonic_nonnegative() {
        let t1 = unix_time_float();
        let t2 = unix_time_float();
        assert!(t1 > 0.0);
        assert!(t2 >= t1);
    }

    #[test]
    fn writes_stripped_lines_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        let logger = EngineLogger::new(file, false, LevelFilter::Info);

        let record = Record::builder()
            .args(format_args!("\x1b[1;32mhello\x1b[0m"))
            .level(Level::Info)
            .build();
        logger.log(&record);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello"));
        assert!(!contents.contains('\x1b'));
    }
}
