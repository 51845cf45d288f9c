//! Remote intent parsers.
//!
//! A parser sends message text to an external NLU service and returns
//! ranked intent candidates. The dispatcher runs all enabled parsers
//! concurrently under a deadline, so a slow or failing service can never
//! hold up local matching.

mod http;

pub use http::HttpIntentParser;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_core::config::ParserEntry;
use courier_core::{Error, Event, Result};

/// Deadline applied to a parser call when the config entry does not set one.
pub const DEFAULT_PARSE_DEADLINE: Duration = Duration::from_secs(10);

/// One intent candidate returned by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMatch {
    pub intent: String,
    pub confidence: f64,
    #[serde(default)]
    pub slots: BTreeMap<String, Value>,
}

#[async_trait]
pub trait Parser: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Returns intent candidates for `event`, finishing within `deadline`.
    async fn parse(&self, event: &Event, deadline: Duration) -> Result<Vec<IntentMatch>>;
}

/// Per-call deadline for `entry`.
pub fn deadline_for(entry: &ParserEntry) -> Duration {
    entry
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PARSE_DEADLINE)
}

/// Confidence floor for `entry`. A candidate scoring exactly the floor passes.
pub fn min_confidence(entry: &ParserEntry) -> f64 {
    entry.min_score.unwrap_or(0.0)
}

/// Builds the parser implementation selected by `entry`.
pub fn build_parser(entry: &ParserEntry) -> Result<Arc<dyn Parser>> {
    match entry.implementation() {
        "http-intent" => Ok(Arc::new(HttpIntentParser::from_entry(entry)?)),
        other => Err(Error::Config(format!("Unknown parser type: {}", other))),
    }
}
