use tracing_subscriber::EnvFilter;

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV: &str = "MAILCACHE_LOG";

/// Install the global subscriber. Output goes to stderr because stdout
/// carries the NDJSON protocol in `--cli` mode.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
