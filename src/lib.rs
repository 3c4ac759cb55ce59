//! Vur-De download engine - core library
//!
//! Wraps the yt-dlp command line tool in a bounded-concurrency download
//! queue with persisted history, and exposes it through an async control
//! handle plus a stream of [`DownloadEvent`]s.

pub mod commands;
pub mod core;
pub mod utils;

// Re-export commonly used types
pub use core::{
    config::AppConfig,
    manager::{DownloadEvent, EventReceiver, ManagerSettings, QueueManager},
    models::{AppError, AppResult, JobRecord, JobSpec, JobStatus, MediaFormat, QueueSnapshot},
    runtime::{spawn_download_runtime, DownloadRuntimeHandle},
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::prober::{MetadataSource, ToolProber};
use crate::core::runner::{ProcessLauncher, ToolLauncher};
use crate::core::store::HistoryStore;

/// Everything the engine needs, built once at startup
pub struct DownloadService {
    pub config: AppConfig,
    pub handle: DownloadRuntimeHandle,
    router: JoinHandle<()>,
}

impl DownloadService {
    /// Wire the real prober and launcher. Returns the service and the event stream.
    pub fn start(config: AppConfig) -> anyhow::Result<(Self, EventReceiver)> {
        let history_path = config.history_path()?;
        let prober: Arc<dyn MetadataSource> = Arc::new(ToolProber::new(&config.tool));
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(ToolLauncher::new(&config));
        Ok(Self::start_with(config, history_path, prober, launcher))
    }

    /// Wire explicit collaborators; must run inside a tokio runtime
    pub fn start_with(
        config: AppConfig,
        history_path: PathBuf,
        prober: Arc<dyn MetadataSource>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> (Self, EventReceiver) {
        let store = Arc::new(HistoryStore::open(
            history_path,
            config.history.retention_hours,
        ));
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut manager = QueueManager::new(
            ManagerSettings::from_config(&config),
            store,
            launcher,
            runner_tx,
            event_tx,
        );
        manager.load_history();

        let (handle, router) = spawn_download_runtime(
            manager,
            runner_rx,
            prober,
            Duration::from_secs(config.history.sweep_interval_secs),
        );

        tracing::info!("📚 {} v{} started", NAME, VERSION);
        (
            Self {
                config,
                handle,
                router,
            },
            event_rx,
        )
    }

    /// Cancel live downloads, close the store and wait for the router to stop
    pub async fn shutdown(self) -> AppResult<()> {
        let result = self.handle.shutdown().await;
        if let Err(e) = self.router.await {
            tracing::warn!("Download router ended abnormally: {}", e);
        }
        result
    }
}

/// Load the configuration, falling back to defaults when it is unreadable or invalid
pub fn load_or_initialize_config() -> AppConfig {
    match AppConfig::load() {
        Ok(cfg) => {
            if let Err(err) = cfg.validate() {
                tracing::warn!(
                    "Invalid configuration detected ({}), falling back to defaults",
                    err
                );
                AppConfig::default()
            } else {
                cfg
            }
        }
        Err(err) => {
            tracing::warn!(
                "Failed to load configuration from disk: {}. Using defaults",
                err
            );
            AppConfig::default()
        }
    }
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
