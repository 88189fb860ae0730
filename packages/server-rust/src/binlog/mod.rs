//! Durability log.
//!
//! Every insert queues its fromId; [`Binlog::flush`] drains the queue into
//! chunk files of `fromId,toId` lines (ids percent-escaped), rewrites the cursor file, and prunes
//! files fully below the cursor. [`Binlog::replay`] re-applies surviving
//! lines at startup and removes the files it read.
//!
//! File I/O is blocking; async callers run these methods on the blocking
//! pool.

mod file_name;
mod queue;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use file_name::BinlogFileName;
pub use queue::DurabilityQueue;

use crate::engine::Engine;
use file_name::{escape_field, unescape_field, CURSOR_FILE};

/// Binlog I/O failure.
#[derive(Debug, Error)]
pub enum BinlogError {
    #[error("binlog I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BinlogError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of one [`Binlog::flush`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub files_written: usize,
    pub lines_written: usize,
    /// Queued ids no longer in the hot cache.
    pub skipped_missing: usize,
    /// Chunks whose file could not be written.
    pub failed_chunks: usize,
    pub pruned: usize,
    pub cursor: Option<String>,
}

/// Outcome of one [`Binlog::replay`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub files: usize,
    pub applied: usize,
    /// Lines at or below the cursor.
    pub skipped_by_cursor: usize,
    pub malformed: usize,
    /// Files that could not be read to the end.
    pub failed_files: usize,
    pub cursor: Option<String>,
}

/// Chunked append-only log in one directory.
#[derive(Debug, Clone)]
pub struct Binlog {
    dir: PathBuf,
    chunk_size: usize,
}

impl Binlog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            dir: dir.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Uses `configured` unless it is empty, in which case the running
    /// executable's directory, then the working directory.
    #[must_use]
    pub fn resolve_dir(configured: &Path) -> PathBuf {
        if !configured.as_os_str().is_empty() {
            return configured.to_path_buf();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn cursor_path(&self) -> PathBuf {
        self.dir.join(CURSOR_FILE)
    }

    /// Drains the engine's durability queue into chunk files.
    ///
    /// Each chunk is synced and closed before the next is opened. A chunk
    /// that fails to write is logged and counted; its ids are not re-queued.
    /// Afterwards, if the engine has a cursor, it is written to the cursor
    /// file and every log file whose last id sorts below it is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`BinlogError`] if the directory cannot be created or the
    /// cursor cannot be written or pruning cannot list the directory.
    pub fn flush(&self, engine: &Engine) -> Result<FlushReport, BinlogError> {
        let mut report = FlushReport::default();
        let mut dir_ready = false;
        loop {
            let chunk = engine.durability().pop_chunk(self.chunk_size);
            let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
                break;
            };
            if !dir_ready {
                fs::create_dir_all(&self.dir).map_err(BinlogError::io(&self.dir))?;
                dir_ready = true;
            }
            let name = BinlogFileName {
                flushed_at: engine.clock().now(),
                first_id: first.clone(),
                last_id: last.clone(),
                count: chunk.len(),
            };
            let path = self.dir.join(name.to_string());
            match write_chunk(&path, engine, &chunk) {
                Ok((written, missing)) => {
                    report.files_written += 1;
                    report.lines_written += written;
                    report.skipped_missing += missing;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to write binlog chunk");
                    report.failed_chunks += 1;
                }
            }
        }

        report.cursor = engine.cursor();
        if let Some(cursor) = &report.cursor {
            fs::create_dir_all(&self.dir).map_err(BinlogError::io(&self.dir))?;
            let cursor_path = self.cursor_path();
            fs::write(&cursor_path, cursor).map_err(BinlogError::io(&cursor_path))?;
            report.pruned = self.prune_below(cursor)?;
        }

        metrics::counter!("idmap_binlog_lines_total").increment(report.lines_written as u64);
        if report.files_written > 0 || report.pruned > 0 {
            info!(
                files = report.files_written,
                lines = report.lines_written,
                pruned = report.pruned,
                cursor = ?report.cursor,
                "binlog flushed"
            );
        }
        Ok(report)
    }

    /// Deletes every log file whose last id sorts strictly below `cursor`.
    fn prune_below(&self, cursor: &str) -> Result<usize, BinlogError> {
        let mut pruned = 0;
        for (path, name) in self.log_files()? {
            if name.last_id.as_str() < cursor {
                match fs::remove_file(&path) {
                    Ok(()) => pruned += 1,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to prune binlog file");
                    }
                }
            }
        }
        Ok(pruned)
    }

    /// Log files in the directory, in name order.
    fn log_files(&self) -> Result<Vec<(PathBuf, BinlogFileName)>, BinlogError> {
        let entries = fs::read_dir(&self.dir).map_err(BinlogError::io(&self.dir))?;
        let mut files: Vec<(PathBuf, BinlogFileName)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = BinlogFileName::parse(entry.file_name().to_str()?)?;
                Some((entry.path(), name))
            })
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    /// Reads the cursor file, if present.
    ///
    /// # Errors
    ///
    /// Returns [`BinlogError`] if the file exists but cannot be read.
    pub fn read_cursor(&self) -> Result<Option<String>, BinlogError> {
        let path = self.cursor_path();
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(contents
                .lines()
                .next()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BinlogError::io(&path)(err)),
        }
    }

    /// Re-applies every log line above the cursor through
    /// [`Engine::insert`], deleting each file after reading it.
    ///
    /// The stored cursor also seeds the engine's cursor. Replaying the same
    /// file twice yields the same hot-cache state as replaying it once.
    ///
    /// # Errors
    ///
    /// Returns [`BinlogError`] if the cursor file or the directory cannot be
    /// read. Per-file failures are logged and counted.
    pub fn replay(&self, engine: &Engine) -> Result<ReplayReport, BinlogError> {
        let mut report = ReplayReport::default();
        if !self.dir.is_dir() {
            warn!(dir = %self.dir.display(), "binlog directory missing, nothing to replay");
            return Ok(report);
        }
        report.cursor = self.read_cursor()?;
        if let Some(cursor) = &report.cursor {
            engine.advance_cursor(cursor);
        }

        let cursor = report.cursor.clone();
        for (path, _) in self.log_files()? {
            report.files += 1;
            if let Err(err) = replay_file(&path, engine, cursor.as_deref(), &mut report) {
                warn!(path = %path.display(), error = %err, "failed to read binlog file");
                report.failed_files += 1;
            }
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "failed to delete replayed binlog file");
            }
        }

        info!(
            files = report.files,
            applied = report.applied,
            skipped = report.skipped_by_cursor,
            malformed = report.malformed,
            "binlog replayed"
        );
        Ok(report)
    }
}

/// Writes one chunk file, returning `(lines written, ids skipped)`.
fn write_chunk(path: &Path, engine: &Engine, chunk: &[String]) -> io::Result<(usize, usize)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    let mut missing = 0;
    for from_id in chunk {
        let Some(to_id) = engine.lookup_forward(from_id) else {
            warn!(from_id = %from_id, "id left the hot cache before binlog flush, skipping");
            missing += 1;
            continue;
        };
        writeln!(writer, "{},{}", escape_field(from_id), escape_field(&to_id))?;
        written += 1;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    debug!(path = %path.display(), written, "binlog chunk written");
    Ok((written, missing))
}

fn replay_file(
    path: &Path,
    engine: &Engine,
    cursor: Option<&str>,
    report: &mut ReplayReport,
) -> io::Result<()> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        let mut fields = line.split(',');
        let (Some(from_id), Some(to_id), None) = (
            fields.next().and_then(unescape_field),
            fields.next().and_then(unescape_field),
            fields.next(),
        ) else {
            warn!(line = %line, "malformed binlog line");
            report.malformed += 1;
            continue;
        };
        if cursor.is_some_and(|c| from_id.as_str() <= c) {
            report.skipped_by_cursor += 1;
            continue;
        }
        engine.insert(&from_id, &to_id);
        report.applied += 1;
    }
    Ok(())
}
