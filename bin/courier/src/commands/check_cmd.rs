use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use courier_connectors::build_connector;
use courier_core::{Config, Matcher, Paths};
use courier_parsers::build_parser;
use courier_runtime::build_registry;
use courier_scheduler::{normalize_crontab, resolve_timezone};

use crate::commands::embedded_skills::EmbeddedSource;

/// Validate the config and dry-build every component it names. Nothing is
/// started; a check that passes means `courier run` will come up.
pub async fn run(config_flag: Option<PathBuf>, verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::new(if verbose { "debug" } else { "warn" });
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let paths = Paths::new();
    let config_path = config_flag.unwrap_or_else(|| paths.config_file());
    let config = Config::load(&config_path)
        .with_context(|| format!("cannot load {}", config_path.display()))?;
    println!("config: {}", config_path.display());
    println!("timezone: {}", config.tz()?);

    for entry in &config.connectors {
        build_connector(entry).with_context(|| format!("connector {:?}", entry.name))?;
        println!("connector {}: ok", entry.name);
    }
    if let Some(default) = config.default_connector() {
        println!("default connector: {}", default.name);
    }

    for entry in &config.parsers {
        if !entry.enabled {
            println!("parser {}: disabled", entry.name);
            continue;
        }
        build_parser(entry).with_context(|| format!("parser {:?}", entry.name))?;
        println!("parser {}: ok", entry.name);
    }

    let registry = build_registry(&config, &EmbeddedSource::new()).context("skill registry")?;
    for skill in registry.all() {
        for matcher in &skill.matchers {
            if let Matcher::Crontab { expression, timezone } = matcher {
                normalize_crontab(expression).parse::<cron::Schedule>().map_err(|e| {
                    anyhow::anyhow!(
                        "skill {:?}: bad crontab {:?}: {}",
                        skill.name,
                        expression,
                        e
                    )
                })?;
                if let Some(tz) = timezone {
                    resolve_timezone(tz).with_context(|| format!("skill {:?}", skill.name))?;
                }
            }
        }
        println!("skill {}: ok ({} matchers)", skill.name, skill.matchers.len());
    }

    for entry in &config.databases {
        println!("database {} ({})", entry.name, entry.implementation());
    }

    println!("web: {}", config.web.bind_addr());
    if config.web.webhook_token.is_some() {
        println!("webhook token: set");
    }

    println!("Configuration OK");
    Ok(())
}
