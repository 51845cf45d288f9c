//! Log output wiring driven by the `logging` config section.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use courier_core::config::LoggingConfig;

/// Maps a configured level name onto a tracing directive. Accepts the
/// syslog-flavoured aliases; anything unrecognised falls back to info.
fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warning" | "warn" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}

/// Builds the env-filter directive string. A whitelist turns everything off
/// except the listed targets; a blacklist silences the listed targets.
fn filter_spec(config: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose { "debug" } else { level_directive(&config.level) };
    if !config.filter.whitelist.is_empty() {
        let mut parts = vec!["off".to_string()];
        parts.extend(
            config
                .filter
                .whitelist
                .iter()
                .map(|target| format!("{}={}", target, level)),
        );
        parts.join(",")
    } else if !config.filter.blacklist.is_empty() {
        let mut parts = vec![level.to_string()];
        parts.extend(config.filter.blacklist.iter().map(|target| format!("{}=off", target)));
        parts.join(",")
    } else {
        level.to_string()
    }
}

/// Installs the global subscriber: an optional console layer and an optional
/// append-mode file layer behind one shared level filter.
pub fn init(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::new(filter_spec(config, verbose));

    let console_layer = if config.console {
        Some(
            fmt::layer()
                .with_file(config.extended)
                .with_line_number(config.extended),
        )
    } else {
        None
    };

    let file_layer = match &config.path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_file(config.extended)
                    .with_line_number(config.extended),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(())
}
