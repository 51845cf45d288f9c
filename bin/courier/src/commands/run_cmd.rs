use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use courier_core::{Config, Paths};
use courier_runtime::Supervisor;

use crate::commands::embedded_skills::EmbeddedSource;
use crate::logging;

/// Start the runtime and serve until a shutdown signal lands.
///
/// A missing config file is seeded with the defaults first, so a fresh
/// install comes up with the shell connector and the built-in skills.
pub async fn run(config_flag: Option<PathBuf>, verbose: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = config_flag.unwrap_or_else(|| paths.config_file());

    if !config_path.exists() {
        Config::default()
            .save(&config_path)
            .with_context(|| format!("cannot write starter config to {}", config_path.display()))?;
        eprintln!("Wrote a starter config to {}", config_path.display());
    }

    let config = Config::load(&config_path)
        .with_context(|| format!("cannot load {}", config_path.display()))?;
    logging::init(&config.logging, verbose)?;
    paths.ensure_dirs().context("cannot create state directories")?;

    info!(config = %config_path.display(), "Configuration loaded");

    let supervisor = Supervisor::new(config_path, paths, Arc::new(EmbeddedSource::new()));
    supervisor.run().await?;
    Ok(())
}
