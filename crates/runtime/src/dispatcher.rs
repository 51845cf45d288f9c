//! Candidate selection: local matchers and remote parsers feed one ranked
//! list, and the first entry is the only skill that runs for the event.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use courier_core::config::ParserEntry;
use courier_core::{Error, Event, EventKind, Matcher, MatcherKind, Result};
use courier_parsers::{deadline_for, min_confidence, IntentMatch, Parser};
use courier_skills::{Skill, SkillRegistry};

use crate::metrics::Metrics;

/// One matched skill with the score that ranked it and the event clone
/// carrying its entity annotations.
#[derive(Clone)]
pub struct Candidate {
    pub skill: Arc<Skill>,
    pub event: Event,
    pub score: f64,
    pub kind: MatcherKind,
}

/// A built parser together with the config entry that tunes it.
pub struct ParserSlot {
    pub entry: ParserEntry,
    pub parser: Arc<dyn Parser>,
}

struct RankedEntry {
    /// Registration index, the tiebreak after score.
    index: usize,
    candidate: Candidate,
}

struct ParserCall {
    name: String,
    min_confidence: f64,
    handle: JoinHandle<Result<Vec<IntentMatch>>>,
}

pub struct Dispatcher {
    registry: Arc<RwLock<SkillRegistry>>,
    parsers: Vec<ParserSlot>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RwLock<SkillRegistry>>,
        parsers: Vec<ParserSlot>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { registry, parsers, metrics }
    }

    /// Skills that run for every event, outside the ranked selection.
    pub async fn always_candidates(&self, event: &Event) -> Vec<Candidate> {
        let registry = self.registry.read().await;
        registry
            .with_matcher_kind(MatcherKind::Always)
            .into_iter()
            .map(|skill| Candidate {
                skill,
                event: event.clone(),
                score: 1.0,
                kind: MatcherKind::Always,
            })
            .collect()
    }

    /// Rank every matching skill for `event`, best first.
    ///
    /// Local matchers and remote parsers run concurrently; a local match
    /// scoring 1.0 or higher settles the outcome without waiting for the
    /// parsers. When nothing ranks, catchall skills stand in.
    pub async fn rank(&self, event: &Event) -> Vec<Candidate> {
        self.metrics.record_parsed();
        let skills: Vec<Arc<Skill>> = {
            let registry = self.registry.read().await;
            registry.all().to_vec()
        };

        let parser_calls = self.spawn_parser_calls(event, &skills);
        let mut ranked: Vec<RankedEntry> = Vec::new();
        let mut certain = false;

        if let Some(text) = event.text() {
            for (index, skill) in skills.iter().enumerate() {
                for matcher in &skill.matchers {
                    let hit = match matcher.match_text(text) {
                        Ok(Some(hit)) => hit,
                        Ok(None) => continue,
                        Err(e) => {
                            error!(skill = %skill.name, error = %e, "Matcher failed, counts as no match");
                            continue;
                        }
                    };
                    let raw = matcher.local_score().unwrap_or(0.0);
                    if raw >= 1.0 {
                        certain = true;
                    }
                    let mut enriched = event.clone();
                    enriched.entities.extend(hit.entities);
                    ranked.push(RankedEntry {
                        index,
                        candidate: Candidate {
                            skill: Arc::clone(skill),
                            event: enriched,
                            score: raw.min(1.0),
                            kind: matcher.kind(),
                        },
                    });
                }
            }
        }

        if certain {
            debug!("Local match is certain, skipping parsers");
            for call in parser_calls {
                call.handle.abort();
            }
        } else {
            self.merge_parser_results(event, &skills, parser_calls, &mut ranked).await;
        }

        ranked.sort_by(|a, b| {
            b.candidate
                .score
                .partial_cmp(&a.candidate.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
                .then_with(|| a.candidate.skill.name.cmp(&b.candidate.skill.name))
        });

        if ranked.is_empty() {
            self.catchall_candidates(event, &skills, &mut ranked);
        }

        ranked.into_iter().map(|entry| entry.candidate).collect()
    }

    /// Start every enabled parser that some registered intent matcher
    /// references. Each call carries its own deadline, so one slow service
    /// cannot hold the rest of the pass.
    fn spawn_parser_calls(&self, event: &Event, skills: &[Arc<Skill>]) -> Vec<ParserCall> {
        let mut calls = Vec::new();
        if event.text().is_none() {
            return calls;
        }
        for slot in &self.parsers {
            if !slot.entry.enabled {
                continue;
            }
            let referenced = skills.iter().any(|skill| {
                skill.matchers.iter().any(
                    |m| matches!(m, Matcher::NluIntent { parser, .. } if parser == &slot.entry.name),
                )
            });
            if !referenced {
                debug!(parser = %slot.entry.name, "No intent matcher references this parser, skipping");
                continue;
            }
            let deadline = deadline_for(&slot.entry);
            let parser = Arc::clone(&slot.parser);
            let event = event.clone();
            let name = slot.entry.name.clone();
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(deadline, parser.parse(&event, deadline)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "Parser {} took more than {:?}",
                        name, deadline
                    ))),
                }
            });
            calls.push(ParserCall {
                name: slot.entry.name.clone(),
                min_confidence: min_confidence(&slot.entry),
                handle,
            });
        }
        calls
    }

    async fn merge_parser_results(
        &self,
        event: &Event,
        skills: &[Arc<Skill>],
        calls: Vec<ParserCall>,
        ranked: &mut Vec<RankedEntry>,
    ) {
        for call in calls {
            let matches = match call.handle.await {
                Ok(Ok(matches)) => matches,
                Ok(Err(e)) => {
                    warn!(parser = %call.name, error = %e, "Parser pass failed, local results stand");
                    continue;
                }
                Err(e) => {
                    error!(parser = %call.name, error = %e, "Parser task died");
                    continue;
                }
            };
            for hit in matches {
                if hit.confidence < call.min_confidence {
                    debug!(
                        parser = %call.name,
                        intent = %hit.intent,
                        confidence = hit.confidence,
                        "Below minimum confidence, discarded"
                    );
                    continue;
                }
                for (index, skill) in skills.iter().enumerate() {
                    for matcher in &skill.matchers {
                        let matched = matches!(
                            matcher,
                            Matcher::NluIntent { parser, intent }
                                if parser == &call.name && intent == &hit.intent
                        );
                        if !matched {
                            continue;
                        }
                        let mut enriched = event.clone();
                        for (key, value) in &hit.slots {
                            enriched.entities.insert(key.clone(), value.clone());
                        }
                        ranked.push(RankedEntry {
                            index,
                            candidate: Candidate {
                                skill: Arc::clone(skill),
                                event: enriched,
                                score: hit.confidence,
                                kind: MatcherKind::NluIntent,
                            },
                        });
                    }
                }
            }
        }
    }

    /// Score-zero fallbacks, in registration order. `messages_only`
    /// catchalls skip anything that is not a Message.
    fn catchall_candidates(
        &self,
        event: &Event,
        skills: &[Arc<Skill>],
        ranked: &mut Vec<RankedEntry>,
    ) {
        for (index, skill) in skills.iter().enumerate() {
            for matcher in &skill.matchers {
                let messages_only = match matcher {
                    Matcher::Catchall { messages_only } => *messages_only,
                    _ => continue,
                };
                if messages_only && event.kind() != EventKind::Message {
                    continue;
                }
                ranked.push(RankedEntry {
                    index,
                    candidate: Candidate {
                        skill: Arc::clone(skill),
                        event: event.clone(),
                        score: 0.0,
                        kind: MatcherKind::Catchall,
                    },
                });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use courier_core::matcher::expression_score;
    use courier_core::MatchCondition;

    #[derive(Debug)]
    struct StubParser {
        name: String,
        delay: Duration,
        matches: Vec<IntentMatch>,
    }

    #[async_trait]
    impl Parser for StubParser {
        fn name(&self) -> &str {
            &self.name
        }

        async fn parse(&self, _event: &Event, _deadline: Duration) -> Result<Vec<IntentMatch>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.matches.clone())
        }
    }

    fn entry(name: &str, min_score: Option<f64>, timeout: Option<u64>) -> ParserEntry {
        ParserEntry {
            name: name.to_string(),
            type_name: None,
            enabled: true,
            min_score,
            timeout,
            extra: HashMap::new(),
        }
    }

    fn slot(name: &str, min_score: Option<f64>, timeout: Option<u64>, delay: Duration, matches: Vec<IntentMatch>) -> ParserSlot {
        ParserSlot {
            entry: entry(name, min_score, timeout),
            parser: Arc::new(StubParser { name: name.to_string(), delay, matches }),
        }
    }

    fn intent(name: &str, confidence: f64) -> IntentMatch {
        IntentMatch {
            intent: name.to_string(),
            confidence,
            slots: Default::default(),
        }
    }

    fn registry_with(skills: Vec<Skill>) -> Arc<RwLock<SkillRegistry>> {
        let mut registry = SkillRegistry::default();
        for skill in skills {
            registry.register(skill).unwrap();
        }
        Arc::new(RwLock::new(registry))
    }

    fn dispatcher(skills: Vec<Skill>, parsers: Vec<ParserSlot>) -> Dispatcher {
        Dispatcher::new(registry_with(skills), parsers, Arc::new(Metrics::new(Vec::new())))
    }

    fn message(text: &str) -> Event {
        Event::message("shell", "room", "alice", text)
    }

    #[tokio::test]
    async fn longer_expressions_outrank_shorter_ones() {
        let d = dispatcher(
            vec![
                Skill::builder("short").matcher(Matcher::regex("hello")).build(),
                Skill::builder("long").matcher(Matcher::regex("hello world")).build(),
            ],
            Vec::new(),
        );
        let ranked = d.rank(&message("hello world")).await;
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].skill.name, "long");
        assert_eq!(ranked[0].score, expression_score(11, 0.6));
        assert_eq!(ranked[1].skill.name, "short");
        assert_eq!(ranked[1].score, expression_score(5, 0.6));
    }

    #[tokio::test]
    async fn equal_scores_fall_back_to_registration_order() {
        let d = dispatcher(
            vec![
                Skill::builder("second-name-first-registered").matcher(Matcher::regex("ping")).build(),
                Skill::builder("aaa").matcher(Matcher::regex("ping")).build(),
            ],
            Vec::new(),
        );
        let ranked = d.rank(&message("ping")).await;
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].skill.name, "second-name-first-registered");
    }

    #[tokio::test]
    async fn named_groups_land_in_candidate_entities() {
        let d = dispatcher(
            vec![Skill::builder("deploy")
                .matcher(Matcher::regex(r"deploy (?P<env>\w+)"))
                .build()],
            Vec::new(),
        );
        let ranked = d.rank(&message("deploy staging")).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].event.entities.get("env"), Some(&json!("staging")));
    }

    #[tokio::test]
    async fn intents_map_to_matching_skills_with_slots() {
        let mut hit = intent("weather", 0.9);
        hit.slots.insert("city".to_string(), json!("Berlin"));
        let d = dispatcher(
            vec![
                Skill::builder("weather").matcher(Matcher::nlu_intent("nlu", "weather")).build(),
                Skill::builder("other").matcher(Matcher::nlu_intent("nlu", "other")).build(),
            ],
            vec![slot("nlu", None, None, Duration::ZERO, vec![hit])],
        );
        let ranked = d.rank(&message("what's the weather in berlin")).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].skill.name, "weather");
        assert_eq!(ranked[0].score, 0.9);
        assert_eq!(ranked[0].kind, MatcherKind::NluIntent);
        assert_eq!(ranked[0].event.entities.get("city"), Some(&json!("Berlin")));
    }

    #[tokio::test]
    async fn minimum_confidence_keeps_equal_and_drops_below() {
        let skills = || vec![Skill::builder("greet").matcher(Matcher::nlu_intent("nlu", "greet")).build()];

        let at_threshold = dispatcher(
            skills(),
            vec![slot("nlu", Some(0.7), None, Duration::ZERO, vec![intent("greet", 0.7)])],
        );
        assert_eq!(at_threshold.rank(&message("hi")).await.len(), 1);

        let below = dispatcher(
            skills(),
            vec![slot("nlu", Some(0.75), None, Duration::ZERO, vec![intent("greet", 0.7)])],
        );
        assert!(below.rank(&message("hi")).await.is_empty());
    }

    #[tokio::test]
    async fn certain_local_match_returns_without_the_parsers() {
        let d = dispatcher(
            vec![Skill::builder("exact")
                .matcher(Matcher::regex_with("hello", true, MatchCondition::Search, 2.0))
                .matcher(Matcher::nlu_intent("nlu", "greet"))
                .build()],
            vec![slot("nlu", None, None, Duration::from_secs(5), vec![intent("greet", 0.9)])],
        );
        let started = Instant::now();
        let ranked = d.rank(&message("hello")).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].kind, MatcherKind::Regex);
        assert_eq!(ranked[0].score, 1.0);
    }

    #[tokio::test]
    async fn slow_parser_times_out_and_local_results_stand() {
        let d = dispatcher(
            vec![Skill::builder("both")
                .matcher(Matcher::regex("forecast"))
                .matcher(Matcher::nlu_intent("nlu", "weather"))
                .build()],
            vec![slot("nlu", None, Some(0), Duration::from_secs(5), vec![intent("weather", 0.9)])],
        );
        let started = Instant::now();
        let ranked = d.rank(&message("forecast please")).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].kind, MatcherKind::Regex);
    }

    #[tokio::test]
    async fn parsers_without_intent_matchers_are_not_called() {
        // The stub would rank if called; an empty result proves it was not.
        let d = dispatcher(
            vec![Skill::builder("plain").matcher(Matcher::regex("nothing-matches-this")).build()],
            vec![slot("nlu", None, None, Duration::ZERO, vec![intent("greet", 0.9)])],
        );
        assert!(d.rank(&message("hi")).await.is_empty());
    }

    #[tokio::test]
    async fn catchall_fills_in_only_when_nothing_ranked() {
        let d = dispatcher(
            vec![
                Skill::builder("ping").matcher(Matcher::regex("ping")).build(),
                Skill::builder("fallback").matcher(Matcher::catchall()).build(),
            ],
            Vec::new(),
        );

        let ranked = d.rank(&message("ping")).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].skill.name, "ping");

        let ranked = d.rank(&message("zzz")).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].skill.name, "fallback");
        assert_eq!(ranked[0].score, 0.0);
        assert_eq!(ranked[0].kind, MatcherKind::Catchall);
    }

    #[tokio::test]
    async fn messages_only_catchall_ignores_lifecycle_events() {
        let d = dispatcher(
            vec![
                Skill::builder("fallback").matcher(Matcher::catchall_messages_only()).build(),
                Skill::builder("observer").matcher(Matcher::always()).build(),
            ],
            Vec::new(),
        );

        let started = Event::started("shell");
        assert!(d.rank(&started).await.is_empty());
        assert_eq!(d.always_candidates(&started).await.len(), 1);

        let ranked = d.rank(&message("zzz")).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].skill.name, "fallback");
    }

    #[tokio::test]
    async fn always_skills_never_enter_the_ranking() {
        let d = dispatcher(
            vec![
                Skill::builder("observer").matcher(Matcher::always()).build(),
                Skill::builder("ping").matcher(Matcher::regex("ping")).build(),
            ],
            Vec::new(),
        );
        let event = message("ping");
        let ranked = d.rank(&event).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].skill.name, "ping");
        let always = d.always_candidates(&event).await;
        assert_eq!(always.len(), 1);
        assert_eq!(always[0].skill.name, "observer");
    }
}
