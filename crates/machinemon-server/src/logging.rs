use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. `RUST_LOG` is honoured; MachineMon's
/// own crates log at `info` unless it says otherwise.
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("machinemon=info".parse()?))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}
