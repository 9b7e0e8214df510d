//! Logging configuration using tracing.

use crate::config::LogConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging from the `[log]` section. `RUST_LOG` takes precedence.
pub fn init(log: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match log.output.as_str() {
        "stderr" => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
        "stdout" => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
            .try_init()?,
        other => anyhow::bail!("unsupported log output '{other}' (expected stdout or stderr)"),
    }

    Ok(())
}
