//! Append record batches to date-partitioned IPC stream files.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use log::{debug, error};
use time::Date;

use super::schema::{partition_path, storage_schema};
use crate::error::Result;

/// Most partition files held open at once.
pub const WRITER_POOL_SIZE: usize = 5;

/// Partitioned batch writer with a bounded LRU pool of open files.
///
/// Partition files are opened in append mode; every writer session adds
/// a fresh IPC stream segment (schema header first) to the file, and
/// each batch is pushed to the OS before the next begins, so a crash
/// costs at most the in-flight batch. Admitting a date beyond the pool
/// bound closes the least-recently-used handle.
pub struct BatchWriter {
    base_dir: PathBuf,
    pool: Vec<(Date, StreamWriter<File>)>,
    pool_size: usize,
}

impl BatchWriter {
    pub fn create(base_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_pool_size(base_dir, WRITER_POOL_SIZE)
    }

    pub fn with_pool_size(base_dir: impl Into<PathBuf>, pool_size: usize) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            pool: Vec::new(),
            pool_size: pool_size.max(1),
        })
    }

    /// Number of open partition files (never exceeds the pool size).
    pub fn open_files(&self) -> usize {
        self.pool.len()
    }

    /// Append one batch to `date`'s partition file.
    ///
    /// On an I/O error the handle is dropped so the next batch for the
    /// same date starts over with a fresh file handle; the records of
    /// the failing batch are lost.
    pub fn write_batch(&mut self, batch: &RecordBatch, date: Date) -> Result<()> {
        self.admit(date)?;
        let Some((_, writer)) = self.pool.last_mut() else {
            unreachable!("admit always leaves an entry at the back of the pool");
        };
        match writer.write(batch).and_then(|_| writer.flush()) {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("write failed for partition {date}, dropping handle: {err}");
                self.pool.pop();
                Err(err.into())
            }
        }
    }

    /// Finish every open stream segment and close the files.
    pub fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for (date, mut writer) in self.pool.drain(..) {
            if let Err(err) = writer.finish() {
                error!("closing partition {date} failed: {err}");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err.into()),
        }
    }

    /// Ensure an open writer for `date` sits at the back of the pool
    /// (most recently used), evicting the front when the pool is full.
    fn admit(&mut self, date: Date) -> Result<()> {
        if let Some(index) = self.pool.iter().position(|(open, _)| *open == date) {
            let entry = self.pool.remove(index);
            self.pool.push(entry);
            return Ok(());
        }

        let path = partition_path(&self.base_dir, date);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = StreamWriter::try_new(file, &storage_schema())?;

        if self.pool.len() >= self.pool_size {
            let (evicted, mut old) = self.pool.remove(0);
            debug!("evicting partition writer for {evicted}");
            if let Err(err) = old.finish() {
                error!("closing evicted partition {evicted} failed: {err}");
            }
        }
        self.pool.push((date, writer));
        Ok(())
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::IngestRecord;
    use crate::pipeline::schema::{partition_path, INGEST_DELIMITER};
    use crate::pipeline::transform::storage_batch;
    use time::macros::date;

    fn sample_batch(start_day: &str) -> RecordBatch {
        let line = format!(
            "t!b!c!s!i!G16!sec!{start_day}T03:04:05!{start_day}T03:04:00!?UNKNOWN?!?UNKNOWN?"
        );
        let record = IngestRecord::from_line(line.as_bytes(), INGEST_DELIMITER).unwrap();
        storage_batch(&[record]).unwrap()
    }

    #[test]
    fn test_writes_to_partition_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BatchWriter::create(dir.path()).unwrap();
        writer
            .write_batch(&sample_batch("2025-01-02"), date!(2025 - 01 - 02))
            .unwrap();
        writer.close().unwrap();

        assert!(partition_path(dir.path(), date!(2025 - 01 - 02)).is_file());
    }

    #[test]
    fn test_pool_never_exceeds_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BatchWriter::with_pool_size(dir.path(), 2).unwrap();
        let days = ["2025-01-01", "2025-01-02", "2025-01-03", "2025-01-04"];
        for (index, day) in days.iter().enumerate() {
            let date = date!(2025 - 01 - 01)
                .checked_add(time::Duration::days(index as i64))
                .unwrap();
            writer.write_batch(&sample_batch(day), date).unwrap();
            assert!(writer.open_files() <= 2);
        }
        writer.close().unwrap();
        // Every partition file still landed on disk.
        for index in 0..days.len() {
            let date = date!(2025 - 01 - 01)
                .checked_add(time::Duration::days(index as i64))
                .unwrap();
            assert!(partition_path(dir.path(), date).is_file());
        }
    }

    #[test]
    fn test_reuse_moves_entry_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BatchWriter::with_pool_size(dir.path(), 2).unwrap();
        writer
            .write_batch(&sample_batch("2025-01-01"), date!(2025 - 01 - 01))
            .unwrap();
        writer
            .write_batch(&sample_batch("2025-01-02"), date!(2025 - 01 - 02))
            .unwrap();
        // Touch the older date, then admit a third; the middle one is
        // now least recently used and gets evicted.
        writer
            .write_batch(&sample_batch("2025-01-01"), date!(2025 - 01 - 01))
            .unwrap();
        writer
            .write_batch(&sample_batch("2025-01-03"), date!(2025 - 01 - 03))
            .unwrap();
        let open: Vec<Date> = writer.pool.iter().map(|(date, _)| *date).collect();
        assert_eq!(open, vec![date!(2025 - 01 - 01), date!(2025 - 01 - 03)]);
        writer.close().unwrap();
    }
}
