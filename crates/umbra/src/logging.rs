//! Logging initialization

/// Initialize tracing based on verbosity level
///
/// `RUST_LOG` takes precedence when set.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("umbra={level},umbra_protocol={level},umbra_net={level}").into()
            }),
        )
        .init();
}
