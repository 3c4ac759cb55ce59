//! JSON-lines control bridge
//!
//! Reads one request object per line on stdin and writes responses and
//! download events as JSON lines on stdout. Logs go to stderr.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use vurde_downloader::commands::{dispatch, parse_request, ControlResponse};
use vurde_downloader::utils::logging::init_tracing;
use vurde_downloader::{load_or_initialize_config, AppConfig, DownloadService};

type OutputSender = mpsc::UnboundedSender<String>;

fn emit<T: serde::Serialize>(out: &OutputSender, value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(e) => error!("Failed to serialize bridge output: {}", e),
    }
}

async fn write_output(mut lines: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.recv().await {
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        }
        .await;
        if let Err(e) = written {
            error!("stdout closed: {}", e);
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = AppConfig::load()
        .map(|cfg| cfg.advanced.log_level)
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&level);

    info!("🚀 Starting {} v{}", vurde_downloader::NAME, vurde_downloader::VERSION);

    let config = load_or_initialize_config();
    let (service, mut events) = DownloadService::start(config)?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_output(out_rx));

    let event_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            emit(&event_out, &event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_request(line) {
                        Ok(request) => {
                            // Requests run concurrently so a slow probe never blocks a cancel
                            let handle = service.handle.clone();
                            let out = out_tx.clone();
                            tokio::spawn(async move {
                                let response = dispatch(&handle, request).await;
                                emit(&out, &response);
                            });
                        }
                        Err(message) => {
                            warn!("Rejected bridge input: {}", message);
                            emit(&out_tx, &ControlResponse::error(None, message));
                        }
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("📦 Interrupt received");
                break;
            }
        }
    }

    info!("🔚 Shutting down");
    if let Err(e) = service.shutdown().await {
        warn!("Shutdown reported an error: {}", e);
    }

    drop(out_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), writer).await;
    Ok(())
}
