//! Core data models for the download queue engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Title used whenever neither the probe nor the tool output yields one
pub const UNKNOWN_TITLE: &str = "Unknown Title";

/// Job status enumeration

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,

    Active,

    Paused,

    Completed,

    Failed,

    Cancelled,
}

impl JobStatus {
    /// Completed, failed and cancelled jobs never transition again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the job currently owns a concurrency slot
    pub fn holds_slot(self) -> bool {
        matches!(self, JobStatus::Active | JobStatus::Paused)
    }
}

/// Requested media kind

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Audio,

    Video,
}

/// One admitted single-media download

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: String,

    pub url: String,

    pub format: MediaFormat,

    pub quality: String,

    pub status: JobStatus,

    pub progress: f64,

    pub title: String,

    #[serde(default)]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub file_path: Option<String>,

    #[serde(default)]
    pub file_size: Option<u64>,
}

impl JobRecord {
    /// Create a fresh pending record with a new unique id
    pub fn new(url: String, format: MediaFormat, quality: String, title: Option<String>) -> Self {
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNKNOWN_TITLE.to_string());

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url,
            format,
            quality,
            status: JobStatus::Pending,
            progress: 0.0,
            title,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            expires_at: None,
            file_path: None,
            file_size: None,
        }
    }

    pub fn has_unknown_title(&self) -> bool {
        self.title == UNKNOWN_TITLE
    }

    /// Sort key for history views: completion time, falling back to admission time
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }
}

/// Download request coming from the UI boundary

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    pub url: String,

    pub format: MediaFormat,

    /// Bitrate for audio (e.g. "192K"), selector for video; config default when absent
    #[serde(default)]
    pub quality: Option<String>,

    /// Explicit, ordered playlist member ids (e.g. from a reordered preview)
    #[serde(default)]
    pub playlist_items: Option<Vec<String>>,

    /// Take only the first N playlist entries
    #[serde(default)]
    pub playlist_limit: Option<usize>,
}

impl JobSpec {
    pub fn new(url: impl Into<String>, format: MediaFormat) -> Self {
        Self {
            url: url.into(),
            format,
            quality: None,
            playlist_items: None,
            playlist_limit: None,
        }
    }
}

/// Position of a job inside the batch it was admitted with

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchPosition {
    /// 1-based
    pub index: usize,

    pub total: usize,
}

/// File information attached to a job on successful completion

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletedFile {
    pub title: String,

    pub file_path: Option<String>,

    pub file_size: u64,
}

/// Read-only projection of the queue

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub pending: Vec<JobRecord>,

    pub active: Vec<JobRecord>,

    pub completed: Vec<JobRecord>,
}

/// Single video metadata resolved by a probe

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoInfo {
    pub id: String,

    pub title: String,

    pub uploader: Option<String>,

    /// Seconds
    pub duration: Option<f64>,

    pub thumbnail: Option<String>,

    pub view_count: Option<u64>,

    pub webpage_url: Option<String>,
}

/// One entry of a flattened playlist listing

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistEntry {
    pub id: String,

    pub title: String,

    pub uploader: Option<String>,

    pub duration: Option<f64>,
}

/// Playlist metadata resolved by a probe

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistInfo {
    pub title: String,

    /// Count declared by the playlist, which may exceed `entries.len()` when limited
    pub total_count: usize,

    pub entries: Vec<PlaylistEntry>,
}

/// Result of a metadata probe

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeResult {
    Video(VideoInfo),

    Playlist(PlaylistInfo),
}

/// Availability of the external downloader binary

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInfo {
    pub installed: bool,

    pub version: Option<String>,
}

/// Application error types

#[derive(Debug, thiserror::Error)]

pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Probe error: {message}")]
    Probe { message: String, stderr: String },

    #[error("Failed to start {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    #[error("Process exited with code {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    ProcessFailure { code: Option<i32>, stderr: String },

    #[error("Store error: {0}")]
    StoreIo(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("System error: {0}")]
    System(String),
}

/// Result type alias for application operations

pub type AppResult<T> = Result<T, AppError>;
