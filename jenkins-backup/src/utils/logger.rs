//! Logging setup using tracing.
//!
//! Logs go to stderr; stdout carries command output (bundle paths, tables)
//! so it can be piped.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// HTTP stack targets held back unless RUST_LOG asks for them
const QUIET_TARGETS: &[&str] = &["hyper_util=warn", "reqwest=info", "rustls=warn"];

/// Filter for a `--log-level` / `log.level` value
fn level_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    for directive in QUIET_TARGETS {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initialize logging; RUST_LOG wins over `level`
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}
