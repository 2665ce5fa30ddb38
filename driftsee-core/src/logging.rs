use std::sync::Arc;

use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Install the global subscriber: JSON lines for log shippers, pretty output
/// for a terminal, written to `file_path` when one is configured.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(&config.level)?;
    let writer = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer().with_target(true).with_writer(writer);
    if config.format == "json" {
        registry.with(layer.json()).try_init()?;
    } else {
        registry.with(layer.pretty().with_file(false)).try_init()?;
    }
    Ok(())
}

/// RUST_LOG overrides the configured directives
fn build_filter(directives: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::try_new(directives)?)
}
