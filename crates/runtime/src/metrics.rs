//! Runtime counters, cheap enough to bump from every dispatch path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;

/// Counters for one runtime instance. The per-skill map is built once at
/// load from the registered skill names; recording against an unknown name
/// is a no-op rather than an allocation.
pub struct Metrics {
    messages_parsed: AtomicU64,
    webhooks_called: AtomicU64,
    total_responses: AtomicU64,
    total_response_time_ms: AtomicU64,
    skill_runs: HashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn new(skill_names: impl IntoIterator<Item = String>) -> Self {
        let skill_runs = skill_names
            .into_iter()
            .map(|name| (name, AtomicU64::new(0)))
            .collect();
        Self {
            messages_parsed: AtomicU64::new(0),
            webhooks_called: AtomicU64::new(0),
            total_responses: AtomicU64::new(0),
            total_response_time_ms: AtomicU64::new(0),
            skill_runs,
        }
    }

    /// One inbound event went through ranking.
    pub fn record_parsed(&self) {
        self.messages_parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_webhook(&self) {
        self.webhooks_called.fetch_add(1, Ordering::Relaxed);
    }

    /// One skill handler finished cleanly after `elapsed`.
    pub fn record_response(&self, elapsed: Duration) {
        self.total_responses.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_skill_run(&self, skill: &str) {
        if let Some(counter) = self.skill_runs.get(skill) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn messages_parsed(&self) -> u64 {
        self.messages_parsed.load(Ordering::Relaxed)
    }

    pub fn webhooks_called(&self) -> u64 {
        self.webhooks_called.load(Ordering::Relaxed)
    }

    pub fn total_responses(&self) -> u64 {
        self.total_responses.load(Ordering::Relaxed)
    }

    pub fn skill_runs(&self, skill: &str) -> u64 {
        self.skill_runs
            .get(skill)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Mean handler wall time in milliseconds, zero before the first response.
    pub fn average_response_time_ms(&self) -> u64 {
        let responses = self.total_responses.load(Ordering::Relaxed);
        if responses == 0 {
            return 0;
        }
        self.total_response_time_ms.load(Ordering::Relaxed) / responses
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let skills: serde_json::Map<String, serde_json::Value> = self
            .skill_runs
            .iter()
            .map(|(name, count)| (name.clone(), json!(count.load(Ordering::Relaxed))))
            .collect();
        json!({
            "messages_parsed": self.messages_parsed(),
            "webhooks_called": self.webhooks_called(),
            "total_responses": self.total_responses(),
            "average_response_time_ms": self.average_response_time_ms(),
            "skills": skills,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_is_zero_before_any_response() {
        let metrics = Metrics::new(Vec::new());
        assert_eq!(metrics.average_response_time_ms(), 0);
    }

    #[test]
    fn average_derives_from_totals() {
        let metrics = Metrics::new(Vec::new());
        metrics.record_response(Duration::from_millis(100));
        metrics.record_response(Duration::from_millis(300));
        assert_eq!(metrics.total_responses(), 2);
        assert_eq!(metrics.average_response_time_ms(), 200);
    }

    #[test]
    fn skill_runs_only_count_registered_names() {
        let metrics = Metrics::new(vec!["echo".to_string()]);
        metrics.record_skill_run("echo");
        metrics.record_skill_run("echo");
        metrics.record_skill_run("ghost");
        assert_eq!(metrics.skill_runs("echo"), 2);
        assert_eq!(metrics.skill_runs("ghost"), 0);
    }

    #[test]
    fn snapshot_carries_every_counter() {
        let metrics = Metrics::new(vec!["echo".to_string()]);
        metrics.record_parsed();
        metrics.record_webhook();
        metrics.record_skill_run("echo");
        metrics.record_response(Duration::from_millis(40));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["messages_parsed"], 1);
        assert_eq!(snapshot["webhooks_called"], 1);
        assert_eq!(snapshot["total_responses"], 1);
        assert_eq!(snapshot["average_response_time_ms"], 40);
        assert_eq!(snapshot["skills"]["echo"], 1);
    }
}
