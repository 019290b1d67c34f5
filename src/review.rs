use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::AppResult;

const REVIEW_STEM: &str = "geocode-review";

/// A record that could not be geocoded and needs a human to look at it.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewEntry {
    pub timestamp: DateTime<Utc>,
    /// Input file the record came from.
    pub origin: String,
    /// Row number, or `table#tuple` for SQL input.
    pub locator: String,
    pub address: String,
    pub postal_code: Option<String>,
    pub note: String,
}

impl ReviewEntry {
    pub fn new(
        origin: impl Into<String>,
        locator: impl Into<String>,
        address: impl Into<String>,
        postal_code: Option<String>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            origin: origin.into(),
            locator: locator.into(),
            address: address.into(),
            postal_code,
            note: note.into(),
        }
    }
}

/// Append-only JSONL log of unresolved records, written in batches and
/// rotated by size.
#[derive(Clone)]
pub struct ReviewLog {
    queue: Arc<Mutex<Vec<ReviewEntry>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl ReviewLog {
    pub fn new<P: AsRef<Path>>(dir: P, config: &AppConfig) -> AppResult<Self> {
        Self::with_limits(
            dir,
            config.review_batch_size,
            config.review_buffer_max_bytes,
            config.review_buffer_max_files,
        )
    }

    pub fn with_limits<P: AsRef<Path>>(
        dir: P,
        batch_size: usize,
        max_file_bytes: u64,
        max_file_count: usize,
    ) -> AppResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let buffer_path = dir.join(format!("{REVIEW_STEM}.jsonl"));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: batch_size.max(1),
            max_file_bytes,
            max_file_count,
        })
    }

    pub fn record(&self, entry: ReviewEntry) -> AppResult<()> {
        let mut queue = self.queue.lock();
        queue.push(entry);
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    // Entries stay queued unless the whole batch reached the file.
    fn persist_locked(&self, queue: &mut Vec<ReviewEntry>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::new();
        for entry in queue.iter() {
            serde_json::to_writer(&mut batch, entry)?;
            batch.push(b'\n');
        }
        self.make_room(batch.len() as u64)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        file.write_all(&batch)?;
        file.flush()?;

        debug!(
            path = %self.buffer_path.display(),
            entries = queue.len(),
            "review entries written"
        );
        queue.clear();
        Ok(())
    }

    /// Starts a fresh file when `incoming` bytes would push the current one
    /// past the size limit. Rotated files are named `<stem>-<utc time>.jsonl`.
    fn make_room(&self, incoming: u64) -> AppResult<()> {
        let size = fs::metadata(&self.buffer_path).map_or(0, |m| m.len());
        if size == 0 || size + incoming <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count > 1 {
            let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
            let rotated = self.buffer_path.with_file_name(format!("{REVIEW_STEM}-{stamp}.jsonl"));
            fs::rename(&self.buffer_path, &rotated)?;
            debug!(rotated = %rotated.display(), "review log rotated");
            self.drop_old_rotations()?;
        } else {
            fs::remove_file(&self.buffer_path)?;
        }
        Ok(())
    }

    fn drop_old_rotations(&self) -> AppResult<()> {
        let Some(dir) = self.buffer_path.parent() else {
            return Ok(());
        };
        let prefix = format!("{REVIEW_STEM}-");
        let mut rotated: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map_or(false, |name| name.starts_with(&prefix) && name.ends_with(".jsonl"))
            })
            .collect();

        // Timestamped names sort oldest first.
        rotated.sort();
        let keep = self.max_file_count.saturating_sub(1);
        let excess = rotated.len().saturating_sub(keep);
        for path in rotated.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&path) {
                debug!(%err, path = %path.display(), "could not remove old review log");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(locator: &str) -> ReviewEntry {
        ReviewEntry::new(
            "spots.csv",
            locator,
            "東京都千代田区丸の内1-1-1 第一ビル 3F",
            Some("100-0005".into()),
            "all_fallbacks_failed",
        )
    }

    #[test]
    fn batches_until_flush() {
        let dir = tempdir().unwrap();
        let log = ReviewLog::with_limits(dir.path(), 3, 1024 * 1024, 3).unwrap();
        log.record(entry("2")).unwrap();
        log.record(entry("3")).unwrap();
        assert_eq!(log.queue_depth(), 2);
        assert!(fs::read_to_string(log.buffer_path()).unwrap().is_empty());

        log.flush().unwrap();
        assert_eq!(log.queue_depth(), 0);
        let buffer = fs::read_to_string(log.buffer_path()).unwrap();
        assert_eq!(buffer.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(buffer.lines().next().unwrap()).unwrap();
        assert_eq!(first["locator"], "2");
        assert_eq!(first["note"], "all_fallbacks_failed");
        assert_eq!(first["postal_code"], "100-0005");
    }

    #[test]
    fn writes_when_batch_fills() {
        let dir = tempdir().unwrap();
        let log = ReviewLog::with_limits(dir.path(), 2, 1024 * 1024, 3).unwrap();
        log.record(entry("1")).unwrap();
        log.record(entry("2")).unwrap();
        assert_eq!(log.queue_depth(), 0);
        assert_eq!(fs::read_to_string(log.buffer_path()).unwrap().lines().count(), 2);
    }

    #[test]
    fn keeps_buffer_across_instances() {
        let dir = tempdir().unwrap();
        {
            let log = ReviewLog::with_limits(dir.path(), 10, 1024 * 1024, 3).unwrap();
            log.record(entry("first")).unwrap();
            log.flush().unwrap();
        }
        let log = ReviewLog::with_limits(dir.path(), 10, 1024 * 1024, 3).unwrap();
        log.record(entry("second")).unwrap();
        log.flush().unwrap();

        let buffer = fs::read_to_string(log.buffer_path()).unwrap();
        assert!(buffer.contains("\"first\""));
        assert!(buffer.contains("\"second\""));
    }

    #[test]
    fn rotates_and_prunes_old_files() {
        let dir = tempdir().unwrap();
        let log = ReviewLog::with_limits(dir.path(), 1, 64, 3).unwrap();
        for i in 0..6 {
            log.record(entry(&i.to_string())).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let rotated = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("geocode-review-"))
            .count();
        assert_eq!(rotated, 2);
        let current = fs::read_to_string(log.buffer_path()).unwrap();
        assert!(current.contains("\"locator\":\"5\""));
    }

    #[test]
    fn keeps_queue_when_write_fails() {
        let dir = tempdir().unwrap();
        let log = ReviewLog::with_limits(dir.path(), 1, 1024 * 1024, 3).unwrap();
        fs::remove_file(log.buffer_path()).unwrap();
        fs::create_dir(log.buffer_path()).unwrap();

        assert!(log.record(entry("9")).is_err());
        assert_eq!(log.queue_depth(), 1);

        fs::remove_dir(log.buffer_path()).unwrap();
        log.flush().unwrap();
        assert_eq!(log.queue_depth(), 0);
        assert!(fs::read_to_string(log.buffer_path()).unwrap().contains("\"locator\":\"9\""));
    }

    #[test]
    fn single_file_limit_starts_over() {
        let dir = tempdir().unwrap();
        let log = ReviewLog::with_limits(dir.path(), 1, 64, 1).unwrap();
        log.record(entry("old")).unwrap();
        log.record(entry("new")).unwrap();
        let current = fs::read_to_string(log.buffer_path()).unwrap();
        assert!(!current.contains("\"old\""));
        assert!(current.contains("\"new\""));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
