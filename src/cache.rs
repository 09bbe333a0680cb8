//! Module for the local fallback queue.
//!
//! Readings that could not be written to the database are kept in a single JSON file as an
//! array ordered from oldest to newest. The file is always rewritten as a whole through a
//! temporary file that is renamed over the original, so a crash leaves either the old or the
//! new queue behind.
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Reading;

/// Errors raised while writing the queue file.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("sensor_cache.json")
}

fn default_max_entries() -> usize {
    1000
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct for the parameters of the local fallback queue.
pub struct CacheParameters {
    /// Path to the queue file.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    /// Maximum number of readings kept in the queue.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheParameters {
    fn default() -> Self {
        CacheParameters {
            path: default_cache_path(),
            max_entries: default_max_entries(),
        }
    }
}

/// Bounded, file backed FIFO of readings waiting for the database.
#[derive(Debug, Clone)]
pub struct FallbackQueue {
    path: PathBuf,
    capacity: usize,
}

impl FallbackQueue {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        FallbackQueue { path: path.into(), capacity }
    }

    pub fn from_parameters(params: &CacheParameters) -> Self {
        FallbackQueue::new(params.path.clone(), params.max_entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Loads all queued readings, oldest first.
    ///
    /// A missing file is an empty queue. An unreadable or invalid file is treated the same way,
    /// which discards whatever it contained.
    pub fn load(&self) -> Vec<Reading> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                log::warn!(target: "telemetryd::cache", "Cannot open cache file \'{}\', treating it as empty: \'{}\'", self.path.display(), err);
                return Vec::new();
            }
        };

        match serde_json::from_reader::<_, Vec<Reading>>(BufReader::new(file)) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(target: "telemetryd::cache", "Cache file \'{}\' is corrupted, treating it as empty: \'{}\'", self.path.display(), err);
                Vec::new()
            }
        }
    }

    /// Appends a reading to the tail of the queue.
    ///
    /// # Returns
    ///
    /// * `Ok(dropped)` - The number of oldest entries discarded to stay within the capacity.
    ///
    /// * `Err(...)` - If the queue file cannot be written. The reading is lost in that case.
    ///
    pub fn append(&self, reading: Reading) -> Result<usize, QueueError> {
        let mut entries = self.load();
        entries.push(reading);
        self.store(&entries)
    }

    /// Replaces the queue content with `entries`, keeping only the newest `capacity` of them.
    ///
    /// Returns the number of entries that were dropped to fit.
    pub fn store(&self, entries: &[Reading]) -> Result<usize, QueueError> {
        let dropped = entries.len().saturating_sub(self.capacity);
        if dropped > 0 {
            log::warn!(target: "telemetryd::cache", "Cache exceeds {} entries, dropping the {} oldest", self.capacity, dropped);
        }
        self.write_atomic(&entries[dropped..])?;
        Ok(dropped)
    }

    fn write_atomic(&self, entries: &[Reading]) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.temp_path();
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, entries)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        if let Err(err) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }

        log::trace!(target: "telemetryd::cache", "Wrote {} entries to \'{}\'", entries.len(), self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SensorValues;
    use chrono::{Duration, TimeZone, Utc};

    fn reading(n: i64) -> Reading {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(n);
        Reading::at(timestamp, SensorValues {
            temperature: Some(20.0 + n as f64),
            ..Default::default()
        })
    }

    #[test]
    fn missing_file_is_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new(dir.path().join("cache.json"), 10);
        assert!(queue.load().is_empty());
    }

    #[test]
    fn appended_reading_is_last_element() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new(dir.path().join("cache.json"), 10);

        queue.append(reading(0)).unwrap();
        queue.append(reading(1)).unwrap();

        let entries = queue.load();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.last(), Some(&reading(1)));
    }

    #[test]
    fn overflow_drops_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new(dir.path().join("cache.json"), 2);

        assert_eq!(queue.append(reading(1)).unwrap(), 0);
        assert_eq!(queue.append(reading(2)).unwrap(), 0);
        assert_eq!(queue.append(reading(3)).unwrap(), 1);

        assert_eq!(queue.load(), vec![reading(2), reading(3)]);
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new(dir.path().join("cache.json"), 5);

        for n in 0..23 {
            queue.append(reading(n)).unwrap();
            assert!(queue.load().len() <= 5);
        }
        let entries = queue.load();
        assert_eq!(entries.first(), Some(&reading(18)));
        assert_eq!(entries.last(), Some(&reading(22)));
    }

    #[test]
    fn corrupted_file_is_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let queue = FallbackQueue::new(&path, 10);

        queue.append(reading(0)).unwrap();
        queue.append(reading(1)).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, &content[..content.len() / 2]).unwrap();
        assert!(queue.load().is_empty());

        fs::write(&path, "{\"not\": \"a list\"}").unwrap();
        assert!(queue.load().is_empty());

        queue.append(reading(2)).unwrap();
        assert_eq!(queue.load(), vec![reading(2)]);
    }

    #[test]
    fn write_creates_parent_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        let queue = FallbackQueue::new(&path, 10);

        queue.append(reading(0)).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("nested").join("cache.json.tmp").exists());
        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn store_empty_writes_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let queue = FallbackQueue::new(&path, 10);

        queue.append(reading(0)).unwrap();
        queue.store(&[]).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!([]));
    }
}
