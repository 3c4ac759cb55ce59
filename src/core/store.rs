//! Download history store
//!
//! A single JSON document holding every job record. Each operation performs a
//! full read-modify-write cycle under one mutex. Failures never reach the
//! caller: reads fall back to an empty collection and failed writes are
//! logged and dropped, so a corrupt or locked file cannot stall the queue.
//!
//! I/O is synchronous and runs on the runtime's router task. Only admissions
//! and status transitions write (a handful per job); progress ticks never
//! reach the store.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::core::models::{AppError, AppResult, CompletedFile, JobRecord, JobStatus};

/// Current on-disk schema version
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    /// Absent in files written before versioning; those are version 1
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    downloads: Vec<JobRecord>,
}

fn default_version() -> u32 {
    STORE_VERSION
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            downloads: Vec::new(),
        }
    }
}

/// JSON file backed job history
pub struct HistoryStore {
    path: PathBuf,
    retention: Duration,
    lock: Mutex<()>,
}

impl HistoryStore {
    /// Open (and create if missing) the store at `path`
    pub fn open(path: impl Into<PathBuf>, retention_hours: i64) -> Self {
        let store = Self {
            path: path.into(),
            retention: Duration::hours(retention_hours),
            lock: Mutex::new(()),
        };

        if !store.path.exists() {
            let _guard = store.lock.lock();
            store.write_document(&StoreDocument::default());
        }

        info!("📚 History store at {}", store.path.display());
        store
    }

    /// Add a record; store-stamped fields start empty
    pub fn append(&self, record: &JobRecord) {
        self.mutate(|doc| {
            let mut stored = record.clone();
            if stored.status != JobStatus::Completed {
                stored.completed_at = None;
                stored.expires_at = None;
            }
            doc.downloads.retain(|r| r.id != stored.id);
            doc.downloads.push(stored);
        });
    }

    /// Set the status of a record. Completing through this path stamps expiry too.
    pub fn update_status(&self, id: &str, status: JobStatus, error_message: Option<&str>) {
        let now = Utc::now();
        let retention = self.retention;
        self.mutate(|doc| {
            let Some(record) = doc.downloads.iter_mut().find(|r| r.id == id) else {
                debug!("update_status: no stored record {}", id);
                return;
            };
            record.status = status;
            if let Some(message) = error_message {
                record.error = Some(message.to_string());
            }
            if status == JobStatus::Completed {
                record.completed_at = Some(now);
                record.expires_at = Some(now + retention);
            } else {
                record.expires_at = None;
            }
        });
    }

    /// Mark a record completed with its output file information
    pub fn update_completed(&self, id: &str, file: &CompletedFile) {
        let now = Utc::now();
        let retention = self.retention;
        self.mutate(|doc| {
            let Some(record) = doc.downloads.iter_mut().find(|r| r.id == id) else {
                debug!("update_completed: no stored record {}", id);
                return;
            };
            record.status = JobStatus::Completed;
            record.progress = 100.0;
            record.error = None;
            if !file.title.is_empty() {
                record.title = file.title.clone();
            }
            record.file_path = file.file_path.clone();
            record.file_size = Some(file.file_size);
            record.completed_at = Some(now);
            record.expires_at = Some(now + retention);
        });
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        let _guard = self.lock.lock();
        self.read_document()
            .downloads
            .into_iter()
            .find(|r| r.id == id)
    }

    /// All records, newest admission first
    pub fn list(&self) -> Vec<JobRecord> {
        let _guard = self.lock.lock();
        let mut records = self.read_document().downloads;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Delete a record; returns whether one was removed
    pub fn remove(&self, id: &str) -> bool {
        let mut removed = false;
        self.mutate(|doc| {
            let before = doc.downloads.len();
            doc.downloads.retain(|r| r.id != id);
            removed = doc.downloads.len() != before;
        });
        removed
    }

    /// Remove completed records whose expiry has passed
    pub fn sweep_expired(&self) -> Vec<String> {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut swept = Vec::new();
        self.mutate(|doc| {
            doc.downloads.retain(|record| {
                let expired = record.status == JobStatus::Completed
                    && record.expires_at.is_some_and(|at| at <= now);
                if expired {
                    swept.push(record.id.clone());
                }
                !expired
            });
        });

        if !swept.is_empty() {
            info!("🧹 Swept {} expired downloads from history", swept.len());
        }
        swept
    }

    /// Nothing is buffered; every mutation is already on disk
    pub fn close(&self) {
        let _guard = self.lock.lock();
        debug!("History store closed: {}", self.path.display());
    }

    fn mutate(&self, apply: impl FnOnce(&mut StoreDocument)) {
        let _guard = self.lock.lock();
        let mut doc = self.read_document();
        apply(&mut doc);
        doc.version = STORE_VERSION;
        self.write_document(&doc);
    }

    fn read_document(&self) -> StoreDocument {
        match self.try_read() {
            Ok(doc) => doc,
            Err(e) => {
                error!("Error reading history store {}: {}", self.path.display(), e);
                StoreDocument::default()
            }
        }
    }

    fn try_read(&self) -> AppResult<StoreDocument> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreDocument::default())
            }
            Err(e) => return Err(AppError::StoreIo(e.to_string())),
        };
        let doc: StoreDocument =
            serde_json::from_str(&content).map_err(|e| AppError::StoreIo(e.to_string()))?;
        if doc.version > STORE_VERSION {
            warn!(
                "History store version {} is newer than supported {}",
                doc.version, STORE_VERSION
            );
        }
        Ok(doc)
    }

    fn write_document(&self, doc: &StoreDocument) {
        if let Err(e) = self.try_write(doc) {
            error!("Error writing history store {}: {}", self.path.display(), e);
        }
    }

    fn try_write(&self, doc: &StoreDocument) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::StoreIo(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(doc).map_err(|e| AppError::StoreIo(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| AppError::StoreIo(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| AppError::StoreIo(e.to_string()))
    }
}
