//! Subscriber setup from the `logging` config section.

use tracing_subscriber::EnvFilter;

use tutorflow_core::config::LoggingConfig;

/// Filter directives: base level first, then per-crate overrides.
pub fn directives(config: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        config.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level)
        .chain(config.filters.iter().map(String::as_str))
        .filter(|d| !d.trim().is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. `RUST_LOG` overrides the configured filter.
pub fn init(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(config, verbose)));
    let to_stdout = config.output == "stdout";
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match (config.format.as_str(), to_stdout) {
        ("json", true) => builder.json().with_writer(std::io::stdout).try_init(),
        ("json", false) => builder.json().with_writer(std::io::stderr).try_init(),
        (_, true) => builder.with_writer(std::io::stdout).try_init(),
        (_, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
