/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Output goes to stderr because
/// stdout carries the control bridge protocol.
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("vurde_downloader={default_level},vurde={default_level}").into());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
