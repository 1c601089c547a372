use chrono::{DateTime, Local};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ── Constants ───────────────────────────────────────────────────────────────

/// Lines held in memory before they are written out.
const FLUSH_THRESHOLD: usize = 50;

/// Rotate once the file grows past 20 MB.
const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// Rotation keeps the newest 75% of lines.
const ROTATION_DROP_FRACTION: f64 = 0.25;

/// Environment variable holding the level filter (`error` .. `trace`).
pub const LOG_LEVEL_ENV: &str = "ROOMLINK_LOG";

pub const LOG_FILE_NAME: &str = "roomlink.log";

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("cannot prepare log directory: {0}")]
    Io(#[from] io::Error),
    #[error("a global logger is already installed: {0}")]
    AlreadySet(#[from] SetLoggerError),
}

/// `[2026-01-01 00:00:00.000] [WARN] [roomlink::session::room] text`
fn format_line(at: DateTime<Local>, level: Level, target: &str, text: &str) -> String {
    format!("[{}] [{level}] [{target}] {text}", at.format("%Y-%m-%d %H:%M:%S%.3f"))
}

// ── Buffer ──────────────────────────────────────────────────────────────────

/// Pending lines for one log file.
#[derive(Debug)]
struct LineBuffer {
    path: PathBuf,
    lines: Vec<String>,
}

impl LineBuffer {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lines: Vec::with_capacity(FLUSH_THRESHOLD),
        }
    }

    /// Queue `line`. Returns the batch to write when the buffer is full or the
    /// line is urgent.
    fn push(&mut self, line: String, urgent: bool) -> Option<Vec<String>> {
        self.lines.push(line);
        if urgent || self.lines.len() >= FLUSH_THRESHOLD {
            Some(self.take())
        } else {
            None
        }
    }

    fn take(&mut self) -> Vec<String> {
        std::mem::replace(&mut self.lines, Vec::with_capacity(FLUSH_THRESHOLD))
    }
}

/// Append `lines` to `path`, rotating first if the file is too large.
fn write_batch(path: &Path, lines: &[String], max_size: u64) -> io::Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    rotate_if_larger(path, max_size)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// Drop the oldest quarter of `path` once it exceeds `max_size`. Returns
/// whether the file was rewritten.
fn rotate_if_larger(path: &Path, max_size: u64) -> io::Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size <= max_size {
        return Ok(false);
    }

    let lines: Vec<String> = BufReader::new(File::open(path)?)
        .lines()
        .map_while(Result::ok)
        .collect();
    let keep_from = (lines.len() as f64 * ROTATION_DROP_FRACTION) as usize;

    let mut file = File::create(path)?;
    for line in &lines[keep_from..] {
        writeln!(file, "{line}")?;
    }
    Ok(true)
}

// ── Logger ──────────────────────────────────────────────────────────────────

/// Buffered file logger. Warnings and errors can also be echoed to stderr so
/// a terminal user sees them without tailing the file.
pub struct RoomlinkLogger {
    buffer: Mutex<LineBuffer>,
    level: LevelFilter,
    echo: LevelFilter,
}

impl RoomlinkLogger {
    pub fn new(path: PathBuf, level: LevelFilter) -> Self {
        Self {
            buffer: Mutex::new(LineBuffer::new(path)),
            level,
            echo: LevelFilter::Off,
        }
    }

    /// Also print records at or above `echo` to stderr.
    pub fn with_stderr_echo(mut self, echo: LevelFilter) -> Self {
        self.echo = echo;
        self
    }

    fn append(&self, line: String, level: Level) {
        if level <= self.echo {
            eprintln!("{line}");
        }
        // Take the batch under the lock, write it outside.
        let batch = {
            let mut buffer = self.buffer.lock();
            buffer
                .push(line, level == Level::Error)
                .map(|lines| (buffer.path.clone(), lines))
        };
        if let Some((path, lines)) = batch {
            if let Err(e) = write_batch(&path, &lines, MAX_FILE_SIZE) {
                eprintln!("roomlink: failed to write {}: {e}", path.display());
            }
        }
    }
}

impl Log for RoomlinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let target = record.module_path().unwrap_or_else(|| record.target());
        let line = format_line(Local::now(), record.level(), target, &record.args().to_string());
        self.append(line, record.level());
    }

    fn flush(&self) {
        let (path, lines) = {
            let mut buffer = self.buffer.lock();
            (buffer.path.clone(), buffer.take())
        };
        if let Err(e) = write_batch(&path, &lines, MAX_FILE_SIZE) {
            eprintln!("roomlink: failed to write {}: {e}", path.display());
        }
    }
}

// ── Public init ─────────────────────────────────────────────────────────────

/// Level from `ROOMLINK_LOG`, `info` when unset or unparsable.
pub fn level_from_env() -> LevelFilter {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Install [`RoomlinkLogger`] as the global logger, writing to
/// `<log_dir>/roomlink.log`. Warnings are echoed to stderr.
pub fn init_logger(log_dir: &Path) -> Result<(), LoggerError> {
    fs::create_dir_all(log_dir)?;
    let level = level_from_env();
    let logger = RoomlinkLogger::new(log_dir.join(LOG_FILE_NAME), level)
        .with_stderr_echo(LevelFilter::Warn);
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level);
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
