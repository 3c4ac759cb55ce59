//! Download management commands

use serde::{Deserialize, Serialize};

use crate::core::models::{JobSpec, ProbeResult, QueueSnapshot};
use crate::core::runtime::DownloadRuntimeHandle;

/// Reply to a submit request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitResult {
    pub success: bool,
    pub admitted: usize,
    pub ids: Vec<String>,
}

/// Preview metadata for a URL before downloading
pub async fn probe_url(
    handle: &DownloadRuntimeHandle,
    url: String,
    limit: Option<usize>,
) -> Result<ProbeResult, String> {
    handle.probe(&url, limit).await.map_err(|e| e.to_string())
}

pub async fn submit_download(
    handle: &DownloadRuntimeHandle,
    spec: JobSpec,
) -> Result<SubmitResult, String> {
    tracing::info!("📥 Submit requested for {}", spec.url);
    let ids = handle.submit(spec).await.map_err(|e| e.to_string())?;
    Ok(SubmitResult {
        success: true,
        admitted: ids.len(),
        ids,
    })
}

pub async fn pause_download(handle: &DownloadRuntimeHandle, id: String) -> Result<bool, String> {
    handle.pause(id).await.map_err(|e| e.to_string())
}

pub async fn resume_download(handle: &DownloadRuntimeHandle, id: String) -> Result<bool, String> {
    handle.resume(id).await.map_err(|e| e.to_string())
}

pub async fn cancel_download(handle: &DownloadRuntimeHandle, id: String) -> Result<bool, String> {
    handle.cancel(id).await.map_err(|e| e.to_string())
}

pub async fn get_queue_status(handle: &DownloadRuntimeHandle) -> Result<QueueSnapshot, String> {
    handle.status().await.map_err(|e| e.to_string())
}
