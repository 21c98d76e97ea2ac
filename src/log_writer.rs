//! Unified writer for the engine's ambient NDJSON log (SPEC_FULL.md §10.1).

use crate::schema::LogEntry;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

/// Writes one `LogEntry` per line, file-locked for cross-process safety.
#[derive(Clone)]
pub struct LogWriter {
    logs_dir: PathBuf,
}

impl LogWriter {
    pub fn new(logs_dir: PathBuf) -> io::Result<Self> {
        if !logs_dir.exists() {
            fs::create_dir_all(&logs_dir)?;
        }

        Ok(Self { logs_dir })
    }

    /// Create from environment variable or default location.
    pub fn from_env() -> io::Result<Self> {
        let logs_dir = match std::env::var("TRACEWIRE_LOG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME")
                    .ok()
                    .map(PathBuf::from)
                    .or_else(dirs::home_dir)
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "Could not determine home directory")
                    })?;
                home.join(".tracewire").join("logs")
            }
        };

        Self::new(logs_dir)
    }

    pub fn get_log_file_path(&self, date: &str) -> PathBuf {
        self.logs_dir.join(format!("{date}.jsonl"))
    }

    /// Write a log entry synchronously with buffering and file locking.
    /// The exclusive lock prevents interleaved writes when multiple
    /// processes touch the same log file concurrently.
    pub fn write_sync(&self, entry: &LogEntry) -> io::Result<()> {
        let log_file_path = self.get_log_file_path(&entry.date);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)?;

        file.lock_exclusive()?;

        let mut writer = BufWriter::with_capacity(8192, file);
        serde_json::to_writer(&mut writer, entry)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        Ok(())
    }

    /// Async wrapper: the write itself stays synchronous, run on the
    /// blocking thread pool so it never stalls the async runtime.
    pub async fn write_async(&self, entry: LogEntry) -> io::Result<()> {
        let writer = self.clone();
        tokio::task::spawn_blocking(move || writer.write_sync(&entry))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    pub fn logs_dir(&self) -> &PathBuf {
        &self.logs_dir
    }
}
