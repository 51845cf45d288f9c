//! Generic HTTP bridge to an intent service.
//!
//! The wire contract is deliberately small: POST the message as JSON, get
//! back an array of `{intent, confidence, slots}` objects. Anything that
//! exposes this shape (or an adapter in front of it) can rank intents.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, warn};

use courier_core::config::ParserEntry;
use courier_core::{Error, Event, Result};

use crate::{IntentMatch, Parser};

#[derive(Debug, Serialize)]
struct ParseRequest<'a> {
    text: &'a str,
    connector: &'a str,
    user: &'a str,
    target: &'a str,
}

#[derive(Debug)]
pub struct HttpIntentParser {
    name: String,
    url: String,
    token: Option<String>,
    client: Client,
}

impl HttpIntentParser {
    pub fn new(name: &str, url: &str, token: Option<&str>) -> Self {
        let client = Client::builder()
            .timeout(crate::DEFAULT_PARSE_DEADLINE)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build HTTP client with timeout, using default");
                Client::new()
            });
        Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            token: token.map(str::to_string),
            client,
        }
    }

    pub fn from_entry(entry: &ParserEntry) -> Result<Self> {
        let url = entry
            .extra
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Config(format!("Parser {} has no url", entry.name)))?;
        let token = entry.extra.get("token").and_then(|v| v.as_str());
        Ok(Self::new(&entry.name, url, token))
    }
}

/// Decodes the service response and forces every confidence into `[0, 1]`.
fn decode_body(name: &str, body: &str) -> Result<Vec<IntentMatch>> {
    let mut candidates: Vec<IntentMatch> = serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        Error::Parser(format!(
            "{}: failed to parse response: {} (body: {})",
            name, e, preview
        ))
    })?;
    for candidate in &mut candidates {
        if candidate.confidence.is_nan() {
            warn!(parser = %name, intent = %candidate.intent, "Replacing NaN confidence with 0");
            candidate.confidence = 0.0;
        } else if !(0.0..=1.0).contains(&candidate.confidence) {
            warn!(
                parser = %name,
                intent = %candidate.intent,
                confidence = candidate.confidence,
                "Clamping confidence into [0, 1]"
            );
            candidate.confidence = candidate.confidence.clamp(0.0, 1.0);
        }
    }
    Ok(candidates)
}

#[async_trait]
impl Parser for HttpIntentParser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn parse(&self, event: &Event, deadline: Duration) -> Result<Vec<IntentMatch>> {
        let text = match event.text() {
            Some(text) => text,
            None => return Ok(Vec::new()),
        };
        let request = ParseRequest {
            text,
            connector: &event.connector,
            user: &event.user,
            target: &event.target,
        };
        let mut call = self.client.post(&self.url).timeout(deadline).json(&request);
        if let Some(token) = &self.token {
            call = call.header("Authorization", format!("Bearer {}", token));
        }
        let response = call
            .send()
            .await
            .map_err(|e| Error::Parser(format!("{}: request failed: {}", self.name, e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Parser(format!("{}: failed to read response: {}", self.name, e)))?;
        if !status.is_success() {
            error!(parser = %self.name, status = %status, "Intent service returned an error");
            return Err(Error::Parser(format!(
                "{}: service error {}: {}",
                self.name, status, body
            )));
        }
        let candidates = decode_body(&self.name, &body)?;
        debug!(parser = %self.name, candidates = candidates.len(), "Parsed intents");
        Ok(candidates)
    }
}
