//! Queue Manager - bounded-concurrency scheduling of download jobs
//!
//! Owns the pending queue, the set of live jobs and the in-memory history of
//! finished ones. Every state transition is written to the [`HistoryStore`]
//! and announced on the event channel. The manager itself is single-threaded:
//! the runtime actor is its only caller, so no locking happens here.
//!
//! Admission is split in two. [`resolve_spec`] does the slow probing and may
//! run anywhere; [`QueueManager::enqueue`] only touches state.

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::config::AppConfig;
use crate::core::models::{
    AppError, AppResult, BatchPosition, CompletedFile, JobRecord, JobSpec, JobStatus, MediaFormat,
    ProbeResult, QueueSnapshot,
};
use crate::core::prober::MetadataSource;
use crate::core::runner::{
    JobSignal, Outcome, ProcessControl, ProcessLauncher, RunnerEvent, RunnerMessage, RunnerSender,
};
use crate::core::store::HistoryStore;
use crate::utils::file_utils::{existing_files, recent_files, title_from_path, FoundFile};
use crate::utils::validation::{is_playlist_url, validate_job_spec, validate_video_id, watch_url};

/// Message used for jobs left unfinished by a previous run
pub const INTERRUPTED_MESSAGE: &str = "Interrupted before completion";

/// Events emitted by the queue manager
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DownloadEvent {
    Queued {
        job: JobRecord,
    },
    Started {
        id: String,
        title: String,
    },
    Progress {
        id: String,
        percent: f64,
        speed: String,
        eta: String,
        /// Position inside the admitted batch, or as reported by the tool
        current_index: Option<usize>,
        total_count: Option<usize>,
        current_title: String,
    },
    Paused {
        id: String,
    },
    Resumed {
        id: String,
    },
    Completed {
        id: String,
        title: String,
        files: Vec<String>,
    },
    Error {
        id: String,
        message: String,
    },
    /// Cancellation was requested and the job left the queue
    Cancelled {
        id: String,
    },
    /// The cancelled process has actually exited
    CancelConfirmed {
        id: String,
    },
    HistorySwept {
        removed: Vec<String>,
    },
}

/// Channel for communication between the queue manager and the UI
pub type EventSender = mpsc::UnboundedSender<DownloadEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<DownloadEvent>;

/// Scheduling parameters taken from [`AppConfig`]
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub concurrent_downloads: usize,
    pub download_dir: PathBuf,
    pub recent_file_window: Duration,
    pub audio_quality: String,
    pub video_quality: String,
    pub retention_hours: i64,
}

impl ManagerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            concurrent_downloads: config.download.concurrent_downloads,
            download_dir: config.download.download_path.clone(),
            recent_file_window: Duration::from_secs(config.download.recent_file_window_secs),
            audio_quality: config.download.audio_quality.clone(),
            video_quality: config.download.video_quality.clone(),
            retention_hours: config.history.retention_hours,
        }
    }

    fn quality_for(&self, spec: &JobSpec) -> String {
        match spec.quality.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => match spec.format {
                MediaFormat::Audio => self.audio_quality.clone(),
                MediaFormat::Video => self.video_quality.clone(),
            },
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// A job waiting for a slot
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJob {
    pub record: JobRecord,
    pub position: Option<BatchPosition>,
}

struct ActiveJob {
    record: JobRecord,
    position: Option<BatchPosition>,
    /// Position reported by the tool itself
    tool_position: Option<BatchPosition>,
    control: Box<dyn ProcessControl>,
    output_files: Vec<String>,
    current_title: String,
}

/// Resolve a request into single-video jobs, probing as needed.
///
/// Member probe failures of an explicit playlist selection are logged and
/// skipped; any other probe failure aborts the admission.
pub async fn resolve_spec(
    prober: &dyn MetadataSource,
    settings: &ManagerSettings,
    spec: &JobSpec,
) -> AppResult<Vec<PendingJob>> {
    validate_job_spec(spec)?;

    let quality = settings.quality_for(spec);
    let make = |url: String, title: Option<String>| {
        JobRecord::new(url, spec.format, quality.clone(), title)
    };

    let mut records = Vec::new();
    let selected = spec.playlist_items.as_ref().filter(|ids| !ids.is_empty());

    if is_playlist_url(&spec.url) {
        if let Some(ids) = selected {
            for video_id in ids {
                let url = watch_url(video_id);
                match prober.probe(&url, false, None).await {
                    Ok(ProbeResult::Video(info)) => records.push(make(url, Some(info.title))),
                    Ok(ProbeResult::Playlist(_)) => {
                        warn!("Expected a single video for {}, skipping", video_id)
                    }
                    Err(e) => error!("Failed to get info for video {}: {}", video_id, e),
                }
            }
        } else {
            match prober.probe(&spec.url, true, spec.playlist_limit).await? {
                ProbeResult::Playlist(playlist) => {
                    let limit = spec.playlist_limit.unwrap_or(playlist.entries.len());
                    info!(
                        "📋 Playlist \"{}\": admitting {} of {} entries",
                        playlist.title,
                        limit.min(playlist.entries.len()),
                        playlist.total_count
                    );
                    for entry in playlist.entries.into_iter().take(limit) {
                        if let Err(e) = validate_video_id(&entry.id) {
                            warn!("Skipping playlist entry: {}", e);
                            continue;
                        }
                        records.push(make(watch_url(&entry.id), Some(entry.title)));
                    }
                }
                ProbeResult::Video(info) => records.push(make(spec.url.clone(), Some(info.title))),
            }
        }

        let total = records.len();
        return Ok(records
            .into_iter()
            .enumerate()
            .map(|(i, record)| PendingJob {
                record,
                position: Some(BatchPosition { index: i + 1, total }),
            })
            .collect());
    }

    match prober.probe(&spec.url, false, None).await? {
        ProbeResult::Video(info) => records.push(make(spec.url.clone(), Some(info.title))),
        ProbeResult::Playlist(_) => {
            return Err(AppError::Probe {
                message: format!("Expected a single video at {}", spec.url),
                stderr: String::new(),
            })
        }
    }

    Ok(records
        .into_iter()
        .map(|record| PendingJob {
            record,
            position: None,
        })
        .collect())
}

/// Orchestrates admission, scheduling and completion of downloads
pub struct QueueManager {
    settings: ManagerSettings,
    store: Arc<HistoryStore>,
    launcher: Arc<dyn ProcessLauncher>,
    runner_sender: RunnerSender,
    event_sender: EventSender,

    pending: VecDeque<PendingJob>,
    active: HashMap<String, ActiveJob>,
    completed: HashMap<String, JobRecord>,
    /// Cancelled jobs whose process has not exited yet
    cancelling: HashSet<String>,
}

impl QueueManager {
    pub fn new(
        settings: ManagerSettings,
        store: Arc<HistoryStore>,
        launcher: Arc<dyn ProcessLauncher>,
        runner_sender: RunnerSender,
        event_sender: EventSender,
    ) -> Self {
        Self {
            settings,
            store,
            launcher,
            runner_sender,
            event_sender,
            pending: VecDeque::new(),
            active: HashMap::new(),
            completed: HashMap::new(),
            cancelling: HashSet::new(),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn ceiling(&self) -> usize {
        self.settings.concurrent_downloads.max(1)
    }

    /// Live jobs occupying a slot; paused jobs keep theirs
    fn slots_in_use(&self) -> usize {
        self.active
            .values()
            .filter(|job| job.record.status.holds_slot())
            .count()
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Restore finished jobs from the store. Jobs a previous run left
    /// unfinished are marked failed.
    pub fn load_history(&mut self) -> usize {
        let mut loaded = 0;
        for mut record in self.store.list() {
            if !record.status.is_terminal() {
                warn!("Job {} was interrupted by a previous shutdown", record.id);
                record.status = JobStatus::Failed;
                record.error = Some(INTERRUPTED_MESSAGE.to_string());
                self.store
                    .update_status(&record.id, JobStatus::Failed, Some(INTERRUPTED_MESSAGE));
            }
            self.completed.insert(record.id.clone(), record);
            loaded += 1;
        }
        info!("📚 Loaded {} jobs from history", loaded);
        loaded
    }

    /// Resolve and enqueue in one step
    pub async fn admit(
        &mut self,
        prober: &dyn MetadataSource,
        spec: &JobSpec,
    ) -> AppResult<Vec<String>> {
        let jobs = resolve_spec(prober, &self.settings, spec).await?;
        Ok(self.enqueue(jobs))
    }

    /// Persist and queue resolved jobs, then fill free slots
    pub fn enqueue(&mut self, jobs: Vec<PendingJob>) -> Vec<String> {
        let mut ids = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            job.record.status = JobStatus::Pending;
            self.store.append(&job.record);
            self.emit(DownloadEvent::Queued {
                job: job.record.clone(),
            });
            debug!("Queued job {} ({})", job.record.id, job.record.url);
            ids.push(job.record.id.clone());
            self.pending.push_back(job);
        }

        if !ids.is_empty() {
            info!("📥 Admitted {} jobs", ids.len());
        }
        self.process_queue();
        ids
    }

    /// Promote pending jobs, oldest first, while slots are free
    pub fn process_queue(&mut self) {
        while self.slots_in_use() < self.ceiling() {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            self.start_job(job);
        }
    }

    fn start_job(&mut self, job: PendingJob) {
        let PendingJob { mut record, position } = job;
        record.status = JobStatus::Active;
        self.store.update_status(&record.id, JobStatus::Active, None);
        self.emit(DownloadEvent::Started {
            id: record.id.clone(),
            title: record.title.clone(),
        });

        match self.launcher.launch(&record, self.runner_sender.clone()) {
            Ok(control) => {
                info!("🔄 Started download: {} ({})", record.id, record.title);
                let current_title = record.title.clone();
                self.active.insert(
                    record.id.clone(),
                    ActiveJob {
                        record,
                        position,
                        tool_position: None,
                        control,
                        output_files: Vec::new(),
                        current_title,
                    },
                );
            }
            Err(e) => {
                error!("❌ Failed to start download {}: {}", record.id, e);
                self.fail_job(record, e.to_string());
            }
        }
    }

    fn fail_job(&mut self, mut record: JobRecord, message: String) {
        record.status = JobStatus::Failed;
        record.error = Some(message.clone());
        record.completed_at = None;
        record.expires_at = None;
        self.store
            .update_status(&record.id, JobStatus::Failed, Some(message.as_str()));
        self.emit(DownloadEvent::Error {
            id: record.id.clone(),
            message,
        });
        self.completed.insert(record.id.clone(), record);
    }

    /// Apply one message from a running process
    pub fn handle_runner_message(&mut self, message: RunnerMessage) {
        let RunnerMessage { job_id, event } = message;

        if matches!(event, RunnerEvent::Exited(_)) && self.cancelling.remove(&job_id) {
            info!("Cancelled process for {} has exited", job_id);
            self.emit(DownloadEvent::CancelConfirmed { id: job_id });
            return;
        }

        let Some(job) = self.active.get_mut(&job_id) else {
            debug!("Ignoring runner event for inactive job {}", job_id);
            return;
        };

        match event {
            RunnerEvent::Progress(tick) => {
                let percent = tick.percent.clamp(0.0, 100.0);
                job.record.progress = job.record.progress.max(percent);
                let position = job.position.or(job.tool_position);
                let event = DownloadEvent::Progress {
                    id: job_id,
                    percent: job.record.progress,
                    speed: tick.speed,
                    eta: tick.eta,
                    current_index: position.map(|p| p.index),
                    total_count: position.map(|p| p.total),
                    current_title: job.current_title.clone(),
                };
                self.emit(event);
            }
            RunnerEvent::OutputFile(path) => {
                if let Some(title) = title_from_path(&path) {
                    job.current_title = title;
                }
                if !job.output_files.contains(&path) {
                    job.output_files.push(path);
                }
            }
            RunnerEvent::PlaylistPosition { index, total } => {
                job.tool_position = Some(BatchPosition { index, total });
            }
            RunnerEvent::Exited(outcome) => {
                if let Some(job) = self.active.remove(&job_id) {
                    self.finish_job(job, outcome);
                }
                self.process_queue();
            }
        }
    }

    fn finish_job(&mut self, job: ActiveJob, outcome: Outcome) {
        if outcome.success() {
            self.complete_job(job);
            return;
        }

        let failure = AppError::ProcessFailure {
            code: outcome.exit_code,
            stderr: outcome.stderr.clone(),
        };
        let message = match outcome.stderr.trim() {
            "" => failure.to_string(),
            tail => format!("{}\n{}", failure, tail),
        };
        error!("❌ Download failed: {} - {}", job.record.id, failure);
        self.fail_job(job.record, message);
    }

    /// Files produced by a finished job: the ones the tool reported, or
    /// failing that whatever appeared in the download directory just now
    fn output_files_for(&self, job: &ActiveJob) -> Vec<FoundFile> {
        let reported = existing_files(&job.output_files);
        if !reported.is_empty() {
            return reported;
        }
        recent_files(
            &self.settings.download_dir,
            self.settings.recent_file_window,
            SystemTime::now(),
        )
    }

    fn complete_job(&mut self, job: ActiveJob) {
        let files = self.output_files_for(&job);
        let ActiveJob {
            mut record,
            current_title,
            ..
        } = job;

        if record.has_unknown_title() && !current_title.is_empty() {
            record.title = current_title;
        }

        let completed = CompletedFile {
            title: record.title.clone(),
            file_path: files.last().map(|f| f.path.to_string_lossy().to_string()),
            file_size: files.iter().map(|f| f.size).sum(),
        };
        self.store.update_completed(&record.id, &completed);

        let now = Utc::now();
        let stored = self.store.get(&record.id).filter(|r| r.expires_at.is_some());
        record = match stored {
            Some(stored) => stored,
            None => {
                record.status = JobStatus::Completed;
                record.progress = 100.0;
                record.error = None;
                record.file_path = completed.file_path.clone();
                record.file_size = Some(completed.file_size);
                record.completed_at = Some(now);
                record.expires_at =
                    Some(now + chrono::Duration::hours(self.settings.retention_hours));
                record
            }
        };

        info!("✅ Download completed: {} ({})", record.id, record.title);
        self.emit(DownloadEvent::Completed {
            id: record.id.clone(),
            title: record.title.clone(),
            files: files
                .iter()
                .map(|f| f.path.to_string_lossy().to_string())
                .collect(),
        });
        self.completed.insert(record.id.clone(), record);
    }

    /// Suspend a running job. Returns false when it is not running.
    pub fn pause(&mut self, id: &str) -> AppResult<bool> {
        let Some(job) = self.active.get_mut(id) else {
            return Ok(false);
        };
        if job.record.status != JobStatus::Active {
            return Ok(false);
        }

        job.control.signal(JobSignal::Pause)?;
        job.record.status = JobStatus::Paused;
        self.store.update_status(id, JobStatus::Paused, None);
        self.emit(DownloadEvent::Paused { id: id.to_string() });
        info!("⏸️ Paused download: {}", id);
        Ok(true)
    }

    /// Continue a paused job. Returns false when it is not paused.
    pub fn resume(&mut self, id: &str) -> AppResult<bool> {
        let Some(job) = self.active.get_mut(id) else {
            return Ok(false);
        };
        if job.record.status != JobStatus::Paused {
            return Ok(false);
        }

        job.control.signal(JobSignal::Resume)?;
        job.record.status = JobStatus::Active;
        self.store.update_status(id, JobStatus::Active, None);
        self.emit(DownloadEvent::Resumed { id: id.to_string() });
        info!("▶️ Resumed download: {}", id);
        Ok(true)
    }

    /// Cancel a pending, active or paused job. Unknown and finished jobs are
    /// left alone and yield false.
    pub fn cancel(&mut self, id: &str) -> bool {
        let record = if let Some(mut job) = self.active.remove(id) {
            if let Err(e) = job.control.signal(JobSignal::Cancel) {
                warn!("Failed to signal cancel to {}: {}", id, e);
            }
            self.cancelling.insert(id.to_string());
            job.record
        } else if let Some(index) = self.pending.iter().position(|j| j.record.id == id) {
            match self.pending.remove(index) {
                Some(job) => job.record,
                None => return false,
            }
        } else {
            return false;
        };

        let mut record = record;
        record.status = JobStatus::Cancelled;
        self.store.update_status(id, JobStatus::Cancelled, None);
        self.emit(DownloadEvent::Cancelled { id: id.to_string() });
        info!("🚫 Cancelled download: {}", id);
        self.completed.insert(record.id.clone(), record);

        self.process_queue();
        true
    }

    /// Read-only projection of the queue
    pub fn status(&self) -> QueueSnapshot {
        let mut active: Vec<JobRecord> = self.active.values().map(|j| j.record.clone()).collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut completed: Vec<JobRecord> = self.completed.values().cloned().collect();
        completed.sort_by(|a, b| b.finished_at().cmp(&a.finished_at()));

        QueueSnapshot {
            pending: self.pending.iter().map(|j| j.record.clone()).collect(),
            active,
            completed,
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots_in_use()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Delete a finished job from history. Queued and live jobs must be
    /// cancelled first.
    pub fn remove_from_history(&mut self, id: &str) -> bool {
        if self.active.contains_key(id) || self.pending.iter().any(|j| j.record.id == id) {
            warn!("Refusing to remove unfinished job {} from history", id);
            return false;
        }

        let in_memory = self.completed.remove(id).is_some();
        let in_store = self.store.remove(id);
        if in_memory || in_store {
            info!("🗑️ Removed {} from history", id);
        }
        in_memory || in_store
    }

    pub fn list_history(&self) -> Vec<JobRecord> {
        self.store.list()
    }

    pub fn sweep_expired(&mut self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    /// Drop completed jobs whose retention ended before `now`
    pub fn sweep_expired_at(&mut self, now: chrono::DateTime<Utc>) -> usize {
        let mut removed = self.store.sweep_expired_at(now);

        self.completed.retain(|id, record| {
            let expired = record.status == JobStatus::Completed
                && record.expires_at.is_some_and(|at| at <= now);
            if expired && !removed.contains(id) {
                removed.push(id.clone());
            }
            !expired && !removed.contains(id)
        });

        let count = removed.len();
        if count > 0 {
            self.emit(DownloadEvent::HistorySwept { removed });
        }
        count
    }

    /// Request that re-admits a finished job with its original parameters
    pub fn redownload_spec(&self, id: &str) -> AppResult<JobSpec> {
        let record = self
            .completed
            .get(id)
            .cloned()
            .or_else(|| self.store.get(id))
            .ok_or_else(|| AppError::Validation(format!("No download with id {}", id)))?;

        if !record.status.is_terminal() {
            return Err(AppError::Validation(format!(
                "Download {} is still {:?}",
                id, record.status
            )));
        }

        Ok(JobSpec {
            url: record.url,
            format: record.format,
            quality: Some(record.quality),
            playlist_items: None,
            playlist_limit: None,
        })
    }

    /// Cancel every live process and close the store. Queued jobs stay
    /// pending on disk and are reported interrupted on the next start.
    pub fn shutdown(&mut self) {
        let queued = std::mem::take(&mut self.pending);
        let live: Vec<String> = self.active.keys().cloned().collect();
        info!(
            "🛑 Shutting down queue: {} live, {} queued",
            live.len(),
            queued.len()
        );

        for id in live {
            self.cancel(&id);
        }
        self.store.close();
    }
}
