use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Filter comes from `DOCWRITER_LOG`
/// (falls back to `info`). Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_env("DOCWRITER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
