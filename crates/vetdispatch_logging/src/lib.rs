//! Shared logging setup for vetdispatch binaries.
//!
//! Two sinks: a plain-text file under `$VETDISPATCH_HOME/logs` that rotates by
//! size, and stderr. Both honour `RUST_LOG`.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use vetdispatch_protocol::vetdispatch_home;

const DEFAULT_LOG_FILTER: &str = "vetdispatch=info,vetdispatch_engine=info,vetdispatch_db=info";
/// Current file plus four older generations.
const LOG_GENERATIONS: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by vetdispatch binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter on stderr (debug output included when RUST_LOG asks for it)
    pub verbose: bool,
    /// Only warnings and errors on stderr; the file still gets everything
    pub quiet: bool,
}

/// Initialize tracing with a size-rotated file log and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_log =
        SizeRotatedLog::open(&log_dir, config.app_name, LOG_GENERATIONS, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let console_filter = if config.quiet && !config.verbose {
        EnvFilter::new("warn")
    } else {
        env_filter()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file_log))
                .with_ansi(false)
                .with_filter(env_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Get the logs directory: $VETDISPATCH_HOME/logs
pub fn logs_dir() -> PathBuf {
    vetdispatch_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// `<app>.log` plus numbered older generations `<app>.log.1` (newest) to
/// `<app>.log.<generations - 1>` (oldest). Writes that would push the current
/// file past `max_size` start a new generation first.
///
/// Not synchronized itself; the subscriber wraps it in a `Mutex`.
struct SizeRotatedLog {
    dir: PathBuf,
    stem: String,
    generations: usize,
    max_size: u64,
    file: File,
    written: u64,
}

impl SizeRotatedLog {
    fn open(dir: &Path, app_name: &str, generations: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let stem: String = app_name
            .chars()
            .map(|ch| match ch {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
                _ => '_',
            })
            .collect();

        let path = generation_path(dir, &stem, 0);
        let file = open_append(&path)?;
        let written = file.metadata()?.len();

        let mut log = Self {
            dir: dir.to_path_buf(),
            stem,
            generations: generations.max(1),
            max_size,
            file,
            written,
        };
        if log.written > log.max_size {
            log.start_generation()?;
        }
        Ok(log)
    }

    fn path(&self, generation: usize) -> PathBuf {
        generation_path(&self.dir, &self.stem, generation)
    }

    /// Age every file by one generation, dropping the oldest, and reopen a
    /// fresh current file. With a single generation the current file is truncated.
    fn start_generation(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let oldest = self.generations - 1;
        if oldest == 0 {
            self.file = File::create(self.path(0))?;
            self.written = 0;
            return Ok(());
        }

        for generation in (0..=oldest).rev() {
            let from = self.path(generation);
            if !from.exists() {
                continue;
            }
            if generation == oldest {
                fs::remove_file(&from)?;
            } else {
                fs::rename(&from, self.path(generation + 1))?;
            }
        }

        self.file = open_append(&self.path(0))?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRotatedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let would_be = self.written.saturating_add(buf.len() as u64);
        if self.written > 0 && would_be > self.max_size {
            self.start_generation()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn generation_path(dir: &Path, stem: &str, generation: usize) -> PathBuf {
    match generation {
        0 => dir.join(format!("{stem}.log")),
        n => dir.join(format!("{stem}.log.{n}")),
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn app_name_is_made_path_safe() {
        let tmp = TempDir::new().unwrap();
        let log = SizeRotatedLog::open(tmp.path(), "vet/dispatch serve", 2, 1024).unwrap();
        assert_eq!(log.stem, "vet_dispatch_serve");
        assert!(tmp.path().join("vet_dispatch_serve.log").exists());
    }

    #[test]
    fn rotates_when_size_exceeded_and_keeps_generations() {
        let tmp = TempDir::new().unwrap();
        let mut log = SizeRotatedLog::open(tmp.path(), "dispatch", 3, 16).unwrap();

        for line in [b"first-----\n", b"second----\n", b"third-----\n", b"fourth----\n"] {
            log.write_all(line).unwrap();
        }
        log.flush().unwrap();

        let read = |name: &str| fs::read_to_string(tmp.path().join(name)).unwrap();
        assert_eq!(read("dispatch.log"), "fourth----\n");
        assert_eq!(read("dispatch.log.1"), "third-----\n");
        assert_eq!(read("dispatch.log.2"), "second----\n");
        assert!(!tmp.path().join("dispatch.log.3").exists());
    }

    #[test]
    fn single_generation_truncates_in_place() {
        let tmp = TempDir::new().unwrap();
        let mut log = SizeRotatedLog::open(tmp.path(), "dispatch", 1, 8).unwrap();

        log.write_all(b"aaaaaa").unwrap();
        log.write_all(b"bbbbbb").unwrap();
        log.flush().unwrap();

        assert_eq!(
            fs::read_to_string(tmp.path().join("dispatch.log")).unwrap(),
            "bbbbbb"
        );
        assert!(!tmp.path().join("dispatch.log.1").exists());
    }

    #[test]
    fn reopening_an_oversized_file_starts_fresh() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("dispatch.log"), "x".repeat(64)).unwrap();

        let log = SizeRotatedLog::open(tmp.path(), "dispatch", 2, 16).unwrap();
        assert_eq!(log.written, 0);
        assert_eq!(
            fs::read_to_string(tmp.path().join("dispatch.log.1")).unwrap().len(),
            64
        );
    }
}
