//! Generic persistent record store.
//!
//! A small JSONL-backed collection type used by the engine for the two
//! places it needs durable, file-resident state outside of git itself: the
//! branch/change manifest and the run-capture store. Every collection is a
//! single append-only `<collection>.jsonl` file plus an in-memory index
//! rebuilt on load; writes go through a temp-file-then-rename so a crash
//! mid-write never corrupts the file a concurrent reader sees.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod id;

pub use id::{generate_id, slugify};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("record not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Current time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A scalar value usable in a `Record`'s secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

/// A type that can be stored in a `Store`.
pub trait Record: Serialize + for<'de> Deserialize<'de> + Clone {
    /// Unique identifier within the collection.
    fn id(&self) -> &str;

    /// Last-update timestamp (Unix milliseconds), used to resolve the most
    /// recent version of a record when replaying the append-only log.
    fn updated_at(&self) -> i64;

    /// Name of the backing `.jsonl` file, without extension.
    fn collection_name() -> &'static str;

    /// Fields exposed for secondary lookups (see `Store::find_by`).
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        HashMap::new()
    }
}

/// An append-only, JSONL-backed collection of `T`, replayed into memory on
/// load and indexed by id. Later entries for the same id supersede earlier
/// ones (last-write-wins by `updated_at`, falling back to file order).
pub struct Store<T: Record> {
    path: PathBuf,
    records: HashMap<String, T>,
}

impl<T: Record> Store<T> {
    /// Open (creating if absent) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", T::collection_name()));
        let records = Self::load(&path)?;
        debug!(path = %path.display(), count = records.len(), "Store::open: loaded records");
        Ok(Self { path, records })
    }

    fn load(path: &Path) -> Result<HashMap<String, T>> {
        let mut records: HashMap<String, T> = HashMap::new();
        if !path.exists() {
            return Ok(records);
        }
        let file = fs::File::open(path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: T = serde_json::from_str(&line)?;
            match records.get(record.id()) {
                Some(existing) if existing.updated_at() > record.updated_at() => {}
                _ => {
                    records.insert(record.id().to_string(), record);
                }
            }
        }
        Ok(records)
    }

    /// Append a new version of `record` to the log and update the in-memory
    /// index. The on-disk append itself goes through a temp file + rename so
    /// a concurrent reader never observes a partial line.
    pub fn put(&mut self, record: T) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut existing = if self.path.exists() {
                fs::read_to_string(&self.path)?
            } else {
                String::new()
            };
            existing.push_str(&line);
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(existing.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        self.records.insert(record.id().to_string(), record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.records.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&T> {
        self.get(id).ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn all(&self) -> impl Iterator<Item = &T> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Linear scan for records whose indexed fields match `field == value`.
    pub fn find_by(&self, field: &str, value: &IndexValue) -> Vec<&T> {
        self.records
            .values()
            .filter(|r| r.indexed_fields().get(field) == Some(value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        id: String,
        updated_at: i64,
        status: String,
    }

    impl Record for Widget {
        fn id(&self) -> &str {
            &self.id
        }
        fn updated_at(&self) -> i64 {
            self.updated_at
        }
        fn collection_name() -> &'static str {
            "widgets"
        }
        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut m = HashMap::new();
            m.insert("status".to_string(), IndexValue::String(self.status.clone()));
            m
        }
    }

    #[test]
    fn put_and_get_round_trips() {
        let dir = tempdir().unwrap();
        let mut store: Store<Widget> = Store::open(dir.path()).unwrap();
        store
            .put(Widget {
                id: "a".into(),
                updated_at: 1,
                status: "pending".into(),
            })
            .unwrap();
        assert_eq!(store.get("a").unwrap().status, "pending");
    }

    #[test]
    fn later_write_wins_on_reload() {
        let dir = tempdir().unwrap();
        {
            let mut store: Store<Widget> = Store::open(dir.path()).unwrap();
            store
                .put(Widget {
                    id: "a".into(),
                    updated_at: 1,
                    status: "pending".into(),
                })
                .unwrap();
            store
                .put(Widget {
                    id: "a".into(),
                    updated_at: 2,
                    status: "done".into(),
                })
                .unwrap();
        }
        let reloaded: Store<Widget> = Store::open(dir.path()).unwrap();
        assert_eq!(reloaded.get("a").unwrap().status, "done");
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn find_by_indexed_field() {
        let dir = tempdir().unwrap();
        let mut store: Store<Widget> = Store::open(dir.path()).unwrap();
        store
            .put(Widget {
                id: "a".into(),
                updated_at: 1,
                status: "done".into(),
            })
            .unwrap();
        store
            .put(Widget {
                id: "b".into(),
                updated_at: 1,
                status: "pending".into(),
            })
            .unwrap();
        let done = store.find_by("status", &IndexValue::String("done".into()));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, "a");
    }

    #[test]
    fn missing_record_is_not_found() {
        let dir = tempdir().unwrap();
        let store: Store<Widget> = Store::open(dir.path()).unwrap();
        assert!(matches!(store.require("nope"), Err(StoreError::NotFound(_))));
    }
}
