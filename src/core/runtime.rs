//! Download runtime command router.
//!
//! A single task owns the [`QueueManager`] and serializes everything that
//! touches it: control commands, messages from running processes and the
//! periodic history sweep. Each message is handled to completion before the
//! next one is taken. Probing happens on the caller's task, not here.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};

use crate::core::manager::{resolve_spec, ManagerSettings, PendingJob, QueueManager};
use crate::core::models::{
    AppError, AppResult, JobRecord, JobSpec, ProbeResult, QueueSnapshot, ToolInfo,
};
use crate::core::prober::MetadataSource;
use crate::core::runner::RunnerReceiver;
use crate::utils::validation::{is_playlist_url, validate_url};

const COMMAND_BUFFER: usize = 256;

/// Commands understood by the runtime router.
#[derive(Debug)]
pub enum RuntimeCommand {
    Enqueue {
        jobs: Vec<PendingJob>,
        respond_to: oneshot::Sender<AppResult<Vec<String>>>,
    },
    Pause {
        id: String,
        respond_to: oneshot::Sender<AppResult<bool>>,
    },
    Resume {
        id: String,
        respond_to: oneshot::Sender<AppResult<bool>>,
    },
    Cancel {
        id: String,
        respond_to: oneshot::Sender<AppResult<bool>>,
    },
    Status {
        respond_to: oneshot::Sender<AppResult<QueueSnapshot>>,
    },
    RemoveFromHistory {
        id: String,
        respond_to: oneshot::Sender<AppResult<bool>>,
    },
    ListHistory {
        respond_to: oneshot::Sender<AppResult<Vec<JobRecord>>>,
    },
    RedownloadSpec {
        id: String,
        respond_to: oneshot::Sender<AppResult<JobSpec>>,
    },
    Sweep {
        respond_to: oneshot::Sender<AppResult<usize>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<AppResult<()>>,
    },
}

/// Handle exposed to the control bridge and the rest of the backend.
#[derive(Clone)]
pub struct DownloadRuntimeHandle {
    sender: mpsc::Sender<RuntimeCommand>,
    prober: Arc<dyn MetadataSource>,
    settings: ManagerSettings,
}

impl DownloadRuntimeHandle {
    pub fn new(
        sender: mpsc::Sender<RuntimeCommand>,
        prober: Arc<dyn MetadataSource>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            sender,
            prober,
            settings,
        }
    }

    async fn send_command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<AppResult<T>>) -> RuntimeCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| AppError::System(format!("Download runtime unavailable: {}", e)))?;
        rx.await
            .map_err(|_| AppError::System("Download runtime dropped response".into()))?
    }

    /// Resolve metadata for a URL without admitting anything
    pub async fn probe(&self, url: &str, limit: Option<usize>) -> AppResult<ProbeResult> {
        validate_url(url)?;
        self.prober.probe(url, is_playlist_url(url), limit).await
    }

    /// Admit a request. Probing runs here; only the resolved jobs reach the
    /// router.
    pub async fn submit(&self, spec: JobSpec) -> AppResult<Vec<String>> {
        let jobs = resolve_spec(self.prober.as_ref(), &self.settings, &spec).await?;
        self.send_command(|tx| RuntimeCommand::Enqueue {
            jobs,
            respond_to: tx,
        })
        .await
    }

    pub async fn pause(&self, id: String) -> AppResult<bool> {
        self.send_command(|tx| RuntimeCommand::Pause { id, respond_to: tx })
            .await
    }

    pub async fn resume(&self, id: String) -> AppResult<bool> {
        self.send_command(|tx| RuntimeCommand::Resume { id, respond_to: tx })
            .await
    }

    pub async fn cancel(&self, id: String) -> AppResult<bool> {
        self.send_command(|tx| RuntimeCommand::Cancel { id, respond_to: tx })
            .await
    }

    pub async fn status(&self) -> AppResult<QueueSnapshot> {
        self.send_command(|tx| RuntimeCommand::Status { respond_to: tx })
            .await
    }

    pub async fn remove_from_history(&self, id: String) -> AppResult<bool> {
        self.send_command(|tx| RuntimeCommand::RemoveFromHistory { id, respond_to: tx })
            .await
    }

    pub async fn list_history(&self) -> AppResult<Vec<JobRecord>> {
        self.send_command(|tx| RuntimeCommand::ListHistory { respond_to: tx })
            .await
    }

    /// Admit a finished job again with its original url, format and quality
    pub async fn redownload(&self, id: String) -> AppResult<Vec<String>> {
        let spec = self
            .send_command(|tx| RuntimeCommand::RedownloadSpec { id, respond_to: tx })
            .await?;
        self.submit(spec).await
    }

    pub async fn sweep(&self) -> AppResult<usize> {
        self.send_command(|tx| RuntimeCommand::Sweep { respond_to: tx })
            .await
    }

    pub async fn tool_info(&self) -> ToolInfo {
        self.prober.tool_info().await
    }

    /// Cancel live processes, close the store and stop the router
    pub async fn shutdown(&self) -> AppResult<()> {
        self.send_command(|tx| RuntimeCommand::Shutdown { respond_to: tx })
            .await
    }
}

/// Spawn the router task on the current tokio runtime.
pub fn spawn_download_runtime(
    manager: QueueManager,
    runner_rx: RunnerReceiver,
    prober: Arc<dyn MetadataSource>,
    sweep_interval: Duration,
) -> (DownloadRuntimeHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let settings = manager.settings().clone();

    let join = tokio::spawn(router_loop(manager, rx, runner_rx, sweep_interval));
    info!("[RUNTIME] Router loop spawned");

    (DownloadRuntimeHandle::new(tx, prober, settings), join)
}

async fn router_loop(
    mut manager: QueueManager,
    mut rx: mpsc::Receiver<RuntimeCommand>,
    mut runner_rx: RunnerReceiver,
    sweep_interval: Duration,
) {
    // The first tick fires immediately, sweeping once at startup
    let mut sweep = tokio::time::interval(sweep_interval.max(Duration::from_secs(1)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => {
                    if handle_command(&mut manager, command).is_break() {
                        break;
                    }
                }
                None => {
                    manager.shutdown();
                    break;
                }
            },
            Some(message) = runner_rx.recv() => manager.handle_runner_message(message),
            _ = sweep.tick() => {
                let removed = manager.sweep_expired();
                debug!("[RUNTIME] Periodic sweep removed {} jobs", removed);
            }
        }
    }
    debug!("Download runtime stopped, exiting router loop");
}

#[instrument(skip(manager, command), fields(?command))]
fn handle_command(manager: &mut QueueManager, command: RuntimeCommand) -> ControlFlow<()> {
    match command {
        RuntimeCommand::Enqueue { jobs, respond_to } => {
            let _ = respond_to.send(Ok(manager.enqueue(jobs)));
        }
        RuntimeCommand::Pause { id, respond_to } => {
            debug!("[RUNTIME_CMD] Processing Pause for job: {}", id);
            let _ = respond_to.send(manager.pause(&id));
        }
        RuntimeCommand::Resume { id, respond_to } => {
            debug!("[RUNTIME_CMD] Processing Resume for job: {}", id);
            let _ = respond_to.send(manager.resume(&id));
        }
        RuntimeCommand::Cancel { id, respond_to } => {
            debug!("[RUNTIME_CMD] Processing Cancel for job: {}", id);
            let _ = respond_to.send(Ok(manager.cancel(&id)));
        }
        RuntimeCommand::Status { respond_to } => {
            let _ = respond_to.send(Ok(manager.status()));
        }
        RuntimeCommand::RemoveFromHistory { id, respond_to } => {
            let _ = respond_to.send(Ok(manager.remove_from_history(&id)));
        }
        RuntimeCommand::ListHistory { respond_to } => {
            let _ = respond_to.send(Ok(manager.list_history()));
        }
        RuntimeCommand::RedownloadSpec { id, respond_to } => {
            let _ = respond_to.send(manager.redownload_spec(&id));
        }
        RuntimeCommand::Sweep { respond_to } => {
            let _ = respond_to.send(Ok(manager.sweep_expired()));
        }
        RuntimeCommand::Shutdown { respond_to } => {
            manager.shutdown();
            let _ = respond_to.send(Ok(()));
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manager::{DownloadEvent, EventReceiver};
    use crate::core::models::{JobStatus, MediaFormat, VideoInfo};
    use crate::core::runner::{
        JobSignal, Outcome, ProcessControl, ProcessLauncher, ProgressTick, RunnerEvent,
        RunnerMessage, RunnerSender,
    };
    use crate::core::store::HistoryStore;
    use async_trait::async_trait;
    use tokio::time::timeout;

    struct StaticProber;

    #[async_trait]
    impl MetadataSource for StaticProber {
        async fn probe(
            &self,
            url: &str,
            _is_playlist: bool,
            _limit: Option<usize>,
        ) -> AppResult<ProbeResult> {
            Ok(ProbeResult::Video(VideoInfo {
                id: "abc".to_string(),
                title: format!("Title of {}", url),
                uploader: None,
                duration: None,
                thumbnail: None,
                view_count: None,
                webpage_url: None,
            }))
        }

        async fn tool_info(&self) -> ToolInfo {
            ToolInfo {
                installed: true,
                version: Some("2024.08.06".to_string()),
            }
        }
    }

    struct NoopControl;

    impl ProcessControl for NoopControl {
        fn signal(&mut self, _signal: JobSignal) -> AppResult<()> {
            Ok(())
        }
    }

    /// Finishes every job instantly through the runner channel
    struct InstantLauncher;

    impl ProcessLauncher for InstantLauncher {
        fn launch(
            &self,
            job: &JobRecord,
            events: RunnerSender,
        ) -> AppResult<Box<dyn ProcessControl>> {
            let send = |event| {
                let _ = events.send(RunnerMessage {
                    job_id: job.id.clone(),
                    event,
                });
            };
            send(RunnerEvent::Progress(ProgressTick {
                percent: 100.0,
                speed: "N/A".to_string(),
                eta: "N/A".to_string(),
            }));
            send(RunnerEvent::Exited(Outcome {
                exit_code: Some(0),
                stderr: String::new(),
            }));
            Ok(Box::new(NoopControl))
        }
    }

    fn start(dir: &std::path::Path) -> (DownloadRuntimeHandle, EventReceiver, JoinHandle<()>) {
        let store = Arc::new(HistoryStore::open(dir.join("downloads.json"), 24));
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let settings = ManagerSettings {
            download_dir: dir.join("downloads"),
            ..ManagerSettings::default()
        };
        let manager = QueueManager::new(
            settings,
            store,
            Arc::new(InstantLauncher),
            runner_tx,
            event_tx,
        );
        let (handle, join) = spawn_download_runtime(
            manager,
            runner_rx,
            Arc::new(StaticProber),
            Duration::from_secs(3600),
        );
        (handle, event_rx, join)
    }

    async fn wait_for_completion(events: &mut EventReceiver, id: &str) {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event in time")
                .expect("event channel open");
            if let DownloadEvent::Completed { id: done, .. } = event {
                if done == id {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion_through_router() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events, join) = start(dir.path());

        let spec = JobSpec::new("https://www.youtube.com/watch?v=abc", MediaFormat::Audio);
        let ids = handle.submit(spec).await.unwrap();
        assert_eq!(ids.len(), 1);

        wait_for_completion(&mut events, &ids[0]).await;

        let snapshot = handle.status().await.unwrap();
        assert_eq!(snapshot.completed[0].id, ids[0]);
        assert_eq!(snapshot.completed[0].status, JobStatus::Completed);
        assert_eq!(handle.list_history().await.unwrap().len(), 1);

        assert!(!handle.cancel("unknown".to_string()).await.unwrap());
        assert!(!handle.pause(ids[0].clone()).await.unwrap());

        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert!(handle.status().await.is_err());
    }

    #[tokio::test]
    async fn test_redownload_admits_a_new_job() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events, _join) = start(dir.path());

        let spec = JobSpec::new("https://www.youtube.com/watch?v=abc", MediaFormat::Video);
        let first = handle.submit(spec).await.unwrap().remove(0);
        wait_for_completion(&mut events, &first).await;

        let second = handle.redownload(first.clone()).await.unwrap().remove(0);
        assert_ne!(first, second);
        wait_for_completion(&mut events, &second).await;

        let history = handle.list_history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.format == MediaFormat::Video));
        assert_eq!(handle.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_only_shutdown_stops_command_handling() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HistoryStore::open(dir.path().join("downloads.json"), 24));
        let (runner_tx, _runner_rx) = mpsc::unbounded_channel();
        let (event_tx, _events) = mpsc::unbounded_channel();
        let mut manager = QueueManager::new(
            ManagerSettings::default(),
            store,
            Arc::new(InstantLauncher),
            runner_tx,
            event_tx,
        );

        let (tx, rx) = oneshot::channel();
        let flow = handle_command(&mut manager, RuntimeCommand::Status { respond_to: tx });
        assert!(flow.is_continue());
        assert!(rx.await.unwrap().unwrap().pending.is_empty());

        let (tx, rx) = oneshot::channel();
        let flow = handle_command(&mut manager, RuntimeCommand::Shutdown { respond_to: tx });
        assert!(flow.is_break());
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_probe_rejects_invalid_url() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events, _join) = start(dir.path());

        assert!(matches!(
            handle.probe("not a url", None).await,
            Err(AppError::Validation(_))
        ));
        assert!(handle.tool_info().await.installed);
    }
}
