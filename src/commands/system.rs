//! History and tool commands

use crate::core::models::{JobRecord, ToolInfo};
use crate::core::runtime::DownloadRuntimeHandle;

/// Whether yt-dlp can be started, and its version
pub async fn check_tool(handle: &DownloadRuntimeHandle) -> Result<ToolInfo, String> {
    let info = handle.tool_info().await;
    if !info.installed {
        tracing::warn!("yt-dlp is not available");
    }
    Ok(info)
}

pub async fn get_history(handle: &DownloadRuntimeHandle) -> Result<Vec<JobRecord>, String> {
    handle.list_history().await.map_err(|e| e.to_string())
}

pub async fn remove_from_history(
    handle: &DownloadRuntimeHandle,
    id: String,
) -> Result<bool, String> {
    handle.remove_from_history(id).await.map_err(|e| e.to_string())
}

/// Queue a finished download again; returns the new job ids
pub async fn redownload(
    handle: &DownloadRuntimeHandle,
    id: String,
) -> Result<Vec<String>, String> {
    handle.redownload(id).await.map_err(|e| e.to_string())
}

pub async fn sweep_history(handle: &DownloadRuntimeHandle) -> Result<usize, String> {
    handle.sweep().await.map_err(|e| e.to_string())
}
