use tracing_subscriber::EnvFilter;

/// Normalize a configured level name into a filter directive.
///
/// Unknown names fall back to `info`.
pub fn level_directive(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

/// Initialize tracing for the process.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies to this crate
/// and the AMQP client is held at `warn` so heartbeat chatter stays out of
/// the logs.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},lapin=warn,amq_protocol=warn",
            level_directive(default_level)
        ))
    });

    // try_init so tests and the binary can both call this without panicking
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
