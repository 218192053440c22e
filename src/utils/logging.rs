use tracing_subscriber::EnvFilter;

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "PARLEY_LOG";

/// Pick the filter: `-v` wins, then `PARLEY_LOG`, then warnings only.
pub fn filter_directive(verbose: bool, from_env: Option<String>) -> String {
    if verbose {
        return "parley=debug,warn".to_string();
    }
    from_env
        .filter(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| "warn".to_string())
}

/// Install the global subscriber, writing to stderr so streamed replies on
/// stdout stay clean. Calling it twice is harmless.
pub fn init_tracing(verbose: bool) {
    let directive = filter_directive(verbose, std::env::var(LOG_ENV).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
