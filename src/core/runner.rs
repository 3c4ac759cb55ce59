//! Process runner
//!
//! One external downloader process per active job. A monitor task reads the
//! process output line by line, converts recognised lines into
//! [`RunnerEvent`]s and finishes with exactly one [`RunnerEvent::Exited`].
//! Every message for a job is sent from that single task, so per-job order is
//! the order the tool printed it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::core::config::AppConfig;
use crate::core::models::{AppError, AppResult, JobRecord, MediaFormat};
use crate::utils::file_utils::ensure_dir_exists;

pub const PROGRESS_TEMPLATE: &str =
    "%(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s";

pub const VIDEO_FORMAT: &str =
    "bestvideo[ext=mp4][vcodec^=avc]+bestaudio[ext=m4a]/best[ext=mp4][vcodec^=avc]/best[ext=mp4]";

pub const DEFAULT_AUDIO_QUALITY: &str = "192K";

/// Lines of stderr kept for diagnostics
const STDERR_TAIL_LINES: usize = 20;

static PLAYLIST_POSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+Downloading (?:item|video) (\d+) of (\d+)")
        .expect("valid regex")
});
static DESTINATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(?:download|ExtractAudio)\]\s+Destination:\s+(.+)$").expect("valid regex")
});
static MERGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"(.+)"$"#).expect("valid regex")
});
static ALREADY_DOWNLOADED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+(.+?)\s+has already been downloaded").expect("valid regex")
});
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid regex"));

/// Control signal delivered to a live process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSignal {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressTick {
    pub percent: f64,
    pub speed: String,
    pub eta: String,
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Tail of stderr
    pub stderr: String,
}

impl Outcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Progress(ProgressTick),
    /// A file the tool reported writing
    OutputFile(String),
    PlaylistPosition { index: usize, total: usize },
    Exited(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerMessage {
    pub job_id: String,
    pub event: RunnerEvent,
}

pub type RunnerSender = mpsc::UnboundedSender<RunnerMessage>;
pub type RunnerReceiver = mpsc::UnboundedReceiver<RunnerMessage>;

/// Handle to one live process
pub trait ProcessControl: Send {
    fn signal(&mut self, signal: JobSignal) -> AppResult<()>;
}

/// Starts processes for jobs
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the process for `job`. Its messages are sent on `events`.
    fn launch(&self, job: &JobRecord, events: RunnerSender) -> AppResult<Box<dyn ProcessControl>>;
}

/// Deterministic argument list for downloading one job, URL last
pub fn build_download_args(
    job: &JobRecord,
    download_dir: &Path,
    default_audio_quality: &str,
    playlist_end: Option<usize>,
) -> Vec<String> {
    let output = download_dir.join("%(title)s.%(ext)s");
    let mut args = vec![
        "--output".to_string(),
        output.to_string_lossy().to_string(),
        "--no-check-certificate".to_string(),
        "--no-cache-dir".to_string(),
        "--newline".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
    ];

    match job.format {
        MediaFormat::Audio => {
            let quality = match job.quality.trim() {
                "" => default_audio_quality,
                q => q,
            };
            args.extend(
                [
                    "--extract-audio",
                    "--audio-format",
                    "mp3",
                    "--audio-quality",
                    quality,
                    "--embed-thumbnail",
                    "--add-metadata",
                ]
                .map(String::from),
            );
        }
        MediaFormat::Video => {
            args.push("--format".to_string());
            args.push(VIDEO_FORMAT.to_string());
        }
    }

    if let Some(end) = playlist_end {
        args.push("--playlist-end".to_string());
        args.push(end.to_string());
    }

    args.push(job.url.clone());
    args
}

/// Recognise one line of tool output
pub fn parse_output_line(line: &str) -> Option<RunnerEvent> {
    let line = line.trim();

    if let Some(caps) = DESTINATION_RE.captures(line) {
        return Some(RunnerEvent::OutputFile(caps[1].trim().to_string()));
    }

    if let Some(caps) = MERGER_RE.captures(line) {
        return Some(RunnerEvent::OutputFile(caps[1].to_string()));
    }

    if let Some(caps) = ALREADY_DOWNLOADED_RE.captures(line) {
        return Some(RunnerEvent::OutputFile(caps[1].to_string()));
    }

    if let Some(caps) = PLAYLIST_POSITION_RE.captures(line) {
        let index = caps[1].parse().ok()?;
        let total = caps[2].parse().ok()?;
        return Some(RunnerEvent::PlaylistPosition { index, total });
    }

    if line.contains('|') {
        let mut parts = line.splitn(3, '|');
        let percent_part = parts.next().unwrap_or_default();
        let percent: f64 = PERCENT_RE.captures(percent_part)?[1].parse().ok()?;
        let field = |s: Option<&str>| match s.map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => "N/A".to_string(),
        };
        return Some(RunnerEvent::Progress(ProgressTick {
            percent,
            speed: field(parts.next()),
            eta: field(parts.next()),
        }));
    }

    None
}

/// [`ProcessLauncher`] running the yt-dlp binary
#[derive(Debug, Clone)]
pub struct ToolLauncher {
    binary: String,
    base_args: Vec<String>,
    download_dir: PathBuf,
    default_audio_quality: String,
}

impl ToolLauncher {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            binary: config.tool.binary.clone(),
            base_args: config.tool.base_args.clone(),
            download_dir: config.download.download_path.clone(),
            default_audio_quality: config.download.audio_quality.clone(),
        }
    }
}

impl ProcessLauncher for ToolLauncher {
    fn launch(&self, job: &JobRecord, events: RunnerSender) -> AppResult<Box<dyn ProcessControl>> {
        ensure_dir_exists(&self.download_dir)?;

        // Jobs are always single videos, so no playlist bound is passed
        let args = build_download_args(job, &self.download_dir, &self.default_audio_quality, None);
        info!(
            "Starting download for job {}: {} {}",
            job.id,
            self.binary,
            args.join(" ")
        );

        let child = Command::new(&self.binary)
            .args(&self.base_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Spawn {
                tool: self.binary.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        let kill = Arc::new(Notify::new());
        let exited = Arc::new(AtomicBool::new(false));
        tokio::spawn(monitor_process(
            job.id.clone(),
            child,
            events,
            Arc::clone(&kill),
            Arc::clone(&exited),
        ));

        Ok(Box::new(ToolProcess { pid, kill, exited }))
    }
}

struct ToolProcess {
    pid: Option<u32>,
    #[cfg_attr(unix, allow(dead_code))]
    kill: Arc<Notify>,
    /// Set by the monitor once the child has been reaped; its pid may be reused after that
    exited: Arc<AtomicBool>,
}

#[cfg(unix)]
impl ToolProcess {
    fn send(&self, signal: libc::c_int) -> AppResult<()> {
        let pid = self
            .pid
            .ok_or_else(|| AppError::System("Process id unavailable".to_string()))?;
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(AppError::System(format!(
                "Failed to signal process {}: {}",
                pid,
                std::io::Error::last_os_error()
            )))
        }
    }
}

impl ProcessControl for ToolProcess {
    #[cfg(unix)]
    fn signal(&mut self, signal: JobSignal) -> AppResult<()> {
        if self.exited.load(Ordering::Acquire) {
            debug!("Process {:?} already exited, {:?} not sent", self.pid, signal);
            return Ok(());
        }
        match signal {
            JobSignal::Pause => self.send(libc::SIGSTOP),
            JobSignal::Resume => self.send(libc::SIGCONT),
            JobSignal::Cancel => {
                self.send(libc::SIGTERM)?;
                // A stopped process only acts on SIGTERM once continued
                if let Err(e) = self.send(libc::SIGCONT) {
                    debug!("SIGCONT after SIGTERM failed: {}", e);
                }
                Ok(())
            }
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, signal: JobSignal) -> AppResult<()> {
        if self.exited.load(Ordering::Acquire) {
            debug!("Process {:?} already exited, {:?} not sent", self.pid, signal);
            return Ok(());
        }
        match signal {
            JobSignal::Pause | JobSignal::Resume => Err(AppError::Unsupported(
                "suspending a download process requires a unix platform".to_string(),
            )),
            JobSignal::Cancel => {
                self.kill.notify_one();
                Ok(())
            }
        }
    }
}

async fn monitor_process(
    job_id: String,
    mut child: Child,
    events: RunnerSender,
    kill: Arc<Notify>,
    exited: Arc<AtomicBool>,
) {
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        })
    });

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        debug!("yt-dlp [{}]: {}", job_id, line);
                        if let Some(event) = parse_output_line(&line) {
                            let _ = events.send(RunnerMessage {
                                job_id: job_id.clone(),
                                event,
                            });
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error reading output of job {}: {}", job_id, e);
                        break;
                    }
                },
                _ = kill.notified() => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill process of job {}: {}", job_id, e);
                    }
                }
            }
        }
    }

    let (exit_code, wait_error) = match child.wait().await {
        Ok(status) => (status.code(), None),
        Err(e) => (None, Some(e.to_string())),
    };
    exited.store(true, Ordering::Release);

    let mut stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    if let Some(e) = wait_error {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&e);
    }

    debug!("Process for job {} exited with {:?}", job_id, exit_code);
    let _ = events.send(RunnerMessage {
        job_id,
        event: RunnerEvent::Exited(Outcome { exit_code, stderr }),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(format: MediaFormat, quality: &str) -> JobRecord {
        JobRecord::new(
            "https://www.youtube.com/watch?v=abc".to_string(),
            format,
            quality.to_string(),
            Some("Song".to_string()),
        )
    }

    #[test]
    fn test_audio_args() {
        let args = build_download_args(
            &job(MediaFormat::Audio, ""),
            Path::new("/music"),
            DEFAULT_AUDIO_QUALITY,
            None,
        );
        let expected_output = Path::new("/music")
            .join("%(title)s.%(ext)s")
            .to_string_lossy()
            .to_string();
        assert_eq!(
            args,
            vec![
                "--output",
                expected_output.as_str(),
                "--no-check-certificate",
                "--no-cache-dir",
                "--newline",
                "--progress-template",
                PROGRESS_TEMPLATE,
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
                "--embed-thumbnail",
                "--add-metadata",
                "https://www.youtube.com/watch?v=abc",
            ]
        );
    }

    #[test]
    fn test_video_args_with_playlist_end() {
        let args = build_download_args(
            &job(MediaFormat::Video, "best"),
            Path::new("/videos"),
            DEFAULT_AUDIO_QUALITY,
            Some(2),
        );
        let n = args.len();
        assert_eq!(args[n - 5..n - 3], ["--format", VIDEO_FORMAT]);
        assert_eq!(args[n - 3..n - 1], ["--playlist-end", "2"]);
        assert_eq!(args[n - 1], "https://www.youtube.com/watch?v=abc");
        assert!(!args.contains(&"--extract-audio".to_string()));
    }

    #[test]
    fn test_audio_quality_override() {
        let args = build_download_args(
            &job(MediaFormat::Audio, "320K"),
            Path::new("/music"),
            DEFAULT_AUDIO_QUALITY,
            None,
        );
        let pos = args.iter().position(|a| a == "--audio-quality").unwrap();
        assert_eq!(args[pos + 1], "320K");
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_output_line("  45.2%|1.23MiB/s|00:10"),
            Some(RunnerEvent::Progress(ProgressTick {
                percent: 45.2,
                speed: "1.23MiB/s".to_string(),
                eta: "00:10".to_string(),
            }))
        );
        assert_eq!(
            parse_output_line("100%||"),
            Some(RunnerEvent::Progress(ProgressTick {
                percent: 100.0,
                speed: "N/A".to_string(),
                eta: "N/A".to_string(),
            }))
        );
        assert_eq!(parse_output_line("a|b|c"), None);
    }

    #[test]
    fn test_parse_output_markers() {
        assert_eq!(
            parse_output_line("[download] Destination: /music/Song.webm"),
            Some(RunnerEvent::OutputFile("/music/Song.webm".to_string()))
        );
        assert_eq!(
            parse_output_line("[ExtractAudio] Destination: /music/Song.mp3"),
            Some(RunnerEvent::OutputFile("/music/Song.mp3".to_string()))
        );
        assert_eq!(
            parse_output_line(r#"[Merger] Merging formats into "/videos/Clip.mp4""#),
            Some(RunnerEvent::OutputFile("/videos/Clip.mp4".to_string()))
        );
        assert_eq!(
            parse_output_line("[download] /music/Song.mp3 has already been downloaded"),
            Some(RunnerEvent::OutputFile("/music/Song.mp3".to_string()))
        );
    }

    #[test]
    fn test_file_names_resembling_position_lines_stay_markers() {
        assert_eq!(
            parse_output_line("[download] Destination: /music/Downloading video 1 of 2.mp3"),
            Some(RunnerEvent::OutputFile(
                "/music/Downloading video 1 of 2.mp3".to_string()
            ))
        );
        assert_eq!(
            parse_output_line(r#"[Merger] Merging formats into "/videos/Downloading item 4 of 9.mp4""#),
            Some(RunnerEvent::OutputFile(
                "/videos/Downloading item 4 of 9.mp4".to_string()
            ))
        );
        assert_eq!(
            parse_output_line("[download] /music/Downloading video 2 of 5.mp3 has already been downloaded"),
            Some(RunnerEvent::OutputFile(
                "/music/Downloading video 2 of 5.mp3".to_string()
            ))
        );
        assert_eq!(
            parse_output_line("[youtube] Downloading video 1 of 2 webpage"),
            None
        );
    }

    #[test]
    fn test_parse_playlist_position() {
        assert_eq!(
            parse_output_line("[download] Downloading item 3 of 12"),
            Some(RunnerEvent::PlaylistPosition { index: 3, total: 12 })
        );
        assert_eq!(
            parse_output_line("[download] Downloading video 1 of 2"),
            Some(RunnerEvent::PlaylistPosition { index: 1, total: 2 })
        );
    }

    #[test]
    fn test_unrecognised_lines_ignored() {
        assert_eq!(parse_output_line("[youtube] abc: Downloading webpage"), None);
        assert_eq!(parse_output_line(""), None);
    }

    #[cfg(unix)]
    mod fake_tool {
        use super::*;
        use tempfile::TempDir;
        use tokio::time::{timeout, Duration};

        fn launcher_for(script: &str) -> (TempDir, ToolLauncher) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("fake-yt-dlp.sh");
            std::fs::write(&path, script).unwrap();

            let mut config = AppConfig::default();
            config.tool.binary = "sh".to_string();
            config.tool.base_args = vec![path.to_string_lossy().to_string()];
            config.download.download_path = dir.path().join("out");
            (dir, ToolLauncher::new(&config))
        }

        async fn collect_until_exit(rx: &mut RunnerReceiver) -> Vec<RunnerEvent> {
            let mut seen = Vec::new();
            loop {
                let msg = timeout(Duration::from_secs(10), rx.recv())
                    .await
                    .expect("runner message in time")
                    .expect("channel open");
                let done = matches!(msg.event, RunnerEvent::Exited(_));
                seen.push(msg.event);
                if done {
                    return seen;
                }
            }
        }

        #[tokio::test]
        async fn test_events_in_emission_order() {
            let (_dir, launcher) = launcher_for(
                "echo '[download] Destination: /tmp/Song.webm'\n\
                 echo ' 10.0%|1MiB/s|00:09'\n\
                 echo ' 55.0%|1MiB/s|00:04'\n\
                 echo '100.0%|1MiB/s|00:00'\n\
                 echo 'some warning' >&2\n",
            );
            let (tx, mut rx) = mpsc::unbounded_channel();
            let record = job(MediaFormat::Audio, "192K");
            let _control = launcher.launch(&record, tx).unwrap();

            let events = collect_until_exit(&mut rx).await;
            let percents: Vec<f64> = events
                .iter()
                .filter_map(|e| match e {
                    RunnerEvent::Progress(t) => Some(t.percent),
                    _ => None,
                })
                .collect();
            assert_eq!(percents, vec![10.0, 55.0, 100.0]);
            assert_eq!(
                events[0],
                RunnerEvent::OutputFile("/tmp/Song.webm".to_string())
            );
            assert_eq!(
                events.last(),
                Some(&RunnerEvent::Exited(Outcome {
                    exit_code: Some(0),
                    stderr: "some warning".to_string(),
                }))
            );
        }

        #[tokio::test]
        async fn test_nonzero_exit_reported() {
            let (_dir, launcher) = launcher_for("echo 'ERROR: boom' >&2\nexit 3\n");
            let (tx, mut rx) = mpsc::unbounded_channel();
            let _control = launcher.launch(&job(MediaFormat::Video, "best"), tx).unwrap();

            let events = collect_until_exit(&mut rx).await;
            match events.last() {
                Some(RunnerEvent::Exited(outcome)) => {
                    assert_eq!(outcome.exit_code, Some(3));
                    assert!(!outcome.success());
                    assert!(outcome.stderr.contains("ERROR: boom"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_pause_resume_cancel_signals() {
            let (_dir, launcher) =
                launcher_for("echo ' 10.0%|1MiB/s|00:09'\nexec sleep 30\n");
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut control = launcher.launch(&job(MediaFormat::Audio, ""), tx).unwrap();

            let first = timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
            assert!(matches!(first.event, RunnerEvent::Progress(_)));

            control.signal(JobSignal::Pause).unwrap();
            control.signal(JobSignal::Resume).unwrap();
            control.signal(JobSignal::Pause).unwrap();
            control.signal(JobSignal::Cancel).unwrap();

            let events = collect_until_exit(&mut rx).await;
            match events.last() {
                Some(RunnerEvent::Exited(outcome)) => assert!(!outcome.success()),
                other => panic!("unexpected {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_signals_after_exit_are_not_delivered() {
            let (_dir, launcher) = launcher_for("exit 0\n");
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut control = launcher.launch(&job(MediaFormat::Audio, ""), tx).unwrap();

            let events = collect_until_exit(&mut rx).await;
            assert!(matches!(events.last(), Some(RunnerEvent::Exited(_))));

            // the reaped pid is never signalled, so these cannot fail with ESRCH
            control.signal(JobSignal::Pause).unwrap();
            control.signal(JobSignal::Resume).unwrap();
            control.signal(JobSignal::Cancel).unwrap();
        }

        #[tokio::test]
        async fn test_missing_binary_is_spawn_error() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = AppConfig::default();
            config.tool.binary = "/nonexistent/definitely-not-yt-dlp".to_string();
            config.download.download_path = dir.path().to_path_buf();
            let launcher = ToolLauncher::new(&config);

            let (tx, _rx) = mpsc::unbounded_channel();
            let result = launcher.launch(&job(MediaFormat::Audio, ""), tx);
            assert!(matches!(result, Err(AppError::Spawn { .. })));
        }
    }
}
