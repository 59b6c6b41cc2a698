use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `log_level` is used only when `RUST_LOG` is unset, matching the
/// per-transport `log_level` config key falling back to the gateway's
/// `[global] log_level`.
pub fn init_tracing(log_level: &str, show_target: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(show_target)
        .init();
}
