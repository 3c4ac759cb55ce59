//! Offline collaborators for tests that need a running service but never
//! reach the network or spawn processes.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core::config::AppConfig;
use crate::core::manager::{EventReceiver, ManagerSettings, QueueManager};
use crate::core::models::{AppError, AppResult, JobRecord, ProbeResult, ToolInfo};
use crate::core::prober::MetadataSource;
use crate::core::runner::{ProcessControl, ProcessLauncher, RunnerSender};
use crate::core::runtime::{spawn_download_runtime, DownloadRuntimeHandle};
use crate::core::store::HistoryStore;

/// Fails every probe and reports the tool as missing
pub struct OfflineProber;

#[async_trait]
impl MetadataSource for OfflineProber {
    async fn probe(
        &self,
        url: &str,
        _is_playlist: bool,
        _limit: Option<usize>,
    ) -> AppResult<ProbeResult> {
        Err(AppError::Probe {
            message: format!("offline: {}", url),
            stderr: String::new(),
        })
    }

    async fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            installed: false,
            version: None,
        }
    }
}

/// Refuses to start anything
pub struct RefusingLauncher;

impl ProcessLauncher for RefusingLauncher {
    fn launch(&self, _job: &JobRecord, _events: RunnerSender) -> AppResult<Box<dyn ProcessControl>> {
        Err(AppError::Spawn {
            tool: "yt-dlp".to_string(),
            reason: "launching is disabled in tests".to_string(),
        })
    }
}

pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.download.download_path = dir.join("downloads");
    config
}

/// Runtime over an empty store in `dir`
pub fn offline_runtime(dir: &Path) -> (DownloadRuntimeHandle, EventReceiver) {
    let config = test_config(dir);
    let store = Arc::new(HistoryStore::open(dir.join("downloads.json"), 24));
    let (runner_tx, runner_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let manager = QueueManager::new(
        ManagerSettings::from_config(&config),
        store,
        Arc::new(RefusingLauncher),
        runner_tx,
        event_tx,
    );
    let (handle, _router) = spawn_download_runtime(
        manager,
        runner_rx,
        Arc::new(OfflineProber),
        Duration::from_secs(3600),
    );
    (handle, event_rx)
}
