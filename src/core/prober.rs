//! Metadata probing through the external downloader
//!
//! Runs the tool in dump-info mode and turns its JSON lines into a
//! [`ProbeResult`]. Playlists are listed flat so no media is touched.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::config::ToolConfig;
use crate::core::models::{
    AppError, AppResult, PlaylistEntry, PlaylistInfo, ProbeResult, ToolInfo, VideoInfo,
    UNKNOWN_TITLE,
};

pub const UNKNOWN_PLAYLIST: &str = "Unknown Playlist";

/// Resolves URLs into video or playlist metadata
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn probe(&self, url: &str, is_playlist: bool, limit: Option<usize>)
        -> AppResult<ProbeResult>;

    /// Whether the tool can be started, and its version
    async fn tool_info(&self) -> ToolInfo;
}

/// Outcome of parsing one probe invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutput {
    /// The tool only pointed at another URL
    Redirect(String),
    Resolved(ProbeResult),
}

/// [`MetadataSource`] backed by the yt-dlp binary
#[derive(Debug, Clone)]
pub struct ToolProber {
    binary: String,
    base_args: Vec<String>,
    max_redirects: usize,
}

impl ToolProber {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            base_args: config.base_args.clone(),
            max_redirects: config.max_probe_redirects,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.base_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn probe_once(
        &self,
        url: &str,
        is_playlist: bool,
        limit: Option<usize>,
    ) -> AppResult<ProbeOutput> {
        let args = probe_args(url, is_playlist, limit);
        debug!("[yt-dlp] Executing: {} {}", self.binary, args.join(" "));

        let output = self
            .command()
            .args(&args)
            .output()
            .await
            .map_err(|e| AppError::Spawn {
                tool: self.binary.clone(),
                reason: e.to_string(),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            let message = match stderr.trim() {
                "" => "Failed to get video info".to_string(),
                trimmed => trimmed.to_string(),
            };
            return Err(AppError::Probe { message, stderr });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_probe_output(&stdout, is_playlist, limit).map_err(|e| match e {
            AppError::Probe { message, .. } => AppError::Probe { message, stderr },
            other => other,
        })
    }
}

#[async_trait]
impl MetadataSource for ToolProber {
    async fn probe(
        &self,
        url: &str,
        is_playlist: bool,
        limit: Option<usize>,
    ) -> AppResult<ProbeResult> {
        let mut current = url.to_string();
        let mut hops = 0;

        loop {
            match self.probe_once(&current, is_playlist, limit).await? {
                ProbeOutput::Resolved(result) => return Ok(result),
                ProbeOutput::Redirect(next) => {
                    hops += 1;
                    if hops > self.max_redirects {
                        return Err(AppError::Probe {
                            message: format!(
                                "Too many redirects resolving {} (limit {})",
                                url, self.max_redirects
                            ),
                            stderr: String::new(),
                        });
                    }
                    debug!("Probe of {} redirected to {}", current, next);
                    current = next;
                }
            }
        }
    }

    async fn tool_info(&self) -> ToolInfo {
        let output = self.command().arg("--version").output().await;

        match output {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty());
                info!("{} available, version {:?}", self.binary, version);
                ToolInfo {
                    installed: true,
                    version,
                }
            }
            Ok(output) => {
                warn!("{} --version exited with {}", self.binary, output.status);
                ToolInfo {
                    installed: false,
                    version: None,
                }
            }
            Err(e) => {
                warn!("{} is not available: {}", self.binary, e);
                ToolInfo {
                    installed: false,
                    version: None,
                }
            }
        }
    }
}

/// Argument list for a probe invocation, URL last
pub fn probe_args(url: &str, is_playlist: bool, limit: Option<usize>) -> Vec<String> {
    let mut args = vec!["--dump-json".to_string()];
    if is_playlist {
        args.push("--flat-playlist".to_string());
        if let Some(limit) = limit {
            args.push("--playlist-items".to_string());
            args.push(format!("1-{}", limit));
        }
    }
    args.push(url.to_string());
    args
}

/// Interpret the stdout of a successful probe
pub fn parse_probe_output(
    stdout: &str,
    is_playlist: bool,
    limit: Option<usize>,
) -> AppResult<ProbeOutput> {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let parsed = lines
        .iter()
        .map(|line| serde_json::from_str::<Value>(line))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Probe {
            message: format!("Failed to parse video info: {}", e),
            stderr: String::new(),
        })?;

    if let [single] = parsed.as_slice() {
        if single.get("_type").and_then(Value::as_str) == Some("url") {
            if let Some(next) = single.get("url").and_then(Value::as_str) {
                return Ok(ProbeOutput::Redirect(next.to_string()));
            }
        }
    }

    if is_playlist {
        return Ok(ProbeOutput::Resolved(ProbeResult::Playlist(playlist_from(
            &parsed, limit,
        ))));
    }

    let first = parsed.first().ok_or_else(|| AppError::Probe {
        message: "Failed to parse video info: empty output".to_string(),
        stderr: String::new(),
    })?;
    Ok(ProbeOutput::Resolved(ProbeResult::Video(video_from(first))))
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn uploader_of(value: &Value) -> Option<String> {
    str_field(value, "uploader").or_else(|| str_field(value, "channel"))
}

fn video_from(value: &Value) -> VideoInfo {
    VideoInfo {
        id: str_field(value, "id").unwrap_or_default(),
        title: str_field(value, "title").unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        uploader: uploader_of(value),
        duration: value.get("duration").and_then(Value::as_f64),
        thumbnail: str_field(value, "thumbnail"),
        view_count: value.get("view_count").and_then(Value::as_u64),
        webpage_url: str_field(value, "webpage_url"),
    }
}

fn playlist_from(entries: &[Value], limit: Option<usize>) -> PlaylistInfo {
    let first = entries.first();

    let title = first
        .and_then(|e| str_field(e, "playlist_title"))
        .unwrap_or_else(|| UNKNOWN_PLAYLIST.to_string());
    let total_count = first
        .and_then(|e| e.get("playlist_count"))
        .and_then(Value::as_u64)
        .map(|c| c as usize)
        .unwrap_or(entries.len());

    let mut members: Vec<PlaylistEntry> = entries
        .iter()
        .filter_map(|entry| {
            let Some(id) = str_field(entry, "id") else {
                warn!("Skipping playlist entry without id");
                return None;
            };
            Some(PlaylistEntry {
                id,
                title: str_field(entry, "title").unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
                uploader: uploader_of(entry),
                duration: entry.get("duration").and_then(Value::as_f64),
            })
        })
        .collect();

    if let Some(limit) = limit {
        members.truncate(limit);
    }

    PlaylistInfo {
        title,
        total_count,
        entries: members,
    }
}
