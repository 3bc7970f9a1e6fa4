//! Session log for the TerraPaint binary.
//!
//! `init` opens `TerraPaint/terrapaint.log` under the platform data directory
//! (`%APPDATA%`, `~/Library/Application Support` or `$XDG_DATA_HOME`,
//! falling back to `~/.local/share`) and truncates it, so the file holds one
//! run.  With `echo` every line is also printed to stderr.
//!
//! Library code logs through `log_info!`, `log_warn!` and `log_err!`.  Before
//! `init` those macros do nothing, so an embedding host gets no log file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn tag(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

struct Session {
    path: PathBuf,
    file: Option<Mutex<File>>,
    echo: bool,
}

static SESSION: OnceLock<Session> = OnceLock::new();

/// Path of the open log file, if `init` managed to create one.
pub fn log_path() -> Option<&'static PathBuf> {
    SESSION.get().filter(|s| s.file.is_some()).map(|s| &s.path)
}

pub fn is_active() -> bool {
    SESSION.get().is_some()
}

/// Append one raw line.  I/O errors are dropped.
pub fn write_line(line: &str) {
    let Some(session) = SESSION.get() else { return };
    if let Some(file) = &session.file
        && let Ok(mut f) = file.lock()
    {
        let _ = writeln!(f, "{}", line);
    }
    if session.echo {
        eprintln!("{}", line);
    }
}

pub fn write(level: Level, msg: &str) {
    if !is_active() {
        return;
    }
    write_line(&format_line(level, &clock(), msg));
}

fn format_line(level: Level, clock: &str, msg: &str) -> String {
    format!("[{}] [{}] {}", clock, level.tag(), msg)
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Error, &format!($($arg)*))
    };
}

/// Start the session log.  Later calls are ignored.
///
/// A log file that cannot be opened is reported once on stderr; echoing
/// still works without it.  Panics are written to the log before the
/// previous panic hook runs.
pub fn init(echo: bool) {
    if is_active() {
        return;
    }
    let path = data_dir().join("TerraPaint").join("terrapaint.log");
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new().create(true).write(true).truncate(true).open(&path) {
        Ok(f) => Some(Mutex::new(f)),
        Err(e) => {
            eprintln!("[logger] cannot open {}: {}", path.display(), e);
            None
        }
    };
    let has_file = file.is_some();
    let _ = SESSION.set(Session { path: path.clone(), file, echo });

    if has_file {
        write_line(&format!("=== TerraPaint run, unix time {} ===", unix_secs()));
        write_line(&format!("log: {}", path.display()));
    }

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        write_line(&format!("[{}] [PANIC] {}", clock(), info));
        prev(info);
    }));
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local").join("share"),
        Err(_) => PathBuf::from("."),
    }
}

fn unix_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// UTC wall clock as HH:MM:SS.
fn clock() -> String {
    let secs = unix_secs() % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_are_silent_before_init() {
        crate::log_info!("painting {} stamps", 3);
        crate::log_warn!("pattern '{}' pending", "grass.png");
        assert!(log_path().is_none());
    }

    #[test]
    fn lines_carry_clock_and_level() {
        assert_eq!(format_line(Level::Warn, "01:02:03", "dropped"), "[01:02:03] [WARN] dropped");
        let ts = clock();
        assert_eq!(ts.len(), 8);
        assert_eq!(&ts[2..3], ":");
        assert_eq!(&ts[5..6], ":");
    }
}
