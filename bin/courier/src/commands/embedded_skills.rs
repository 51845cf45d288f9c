//! Skills compiled into the binary.
//!
//! Config entries with a `module` field resolve against the catalog here;
//! entries without one fall through to the script loader. The built-ins are
//! small on purpose: enough for a fresh install to answer back.

use serde_json::json;

use courier_core::config::SkillEntry;
use courier_core::{Error, MatchCondition, Matcher, Result};
use courier_runtime::{ScriptOnlySource, SkillSource};
use courier_skills::Skill;

pub struct EmbeddedSource {
    scripts: ScriptOnlySource,
}

impl EmbeddedSource {
    pub fn new() -> Self {
        Self { scripts: ScriptOnlySource }
    }
}

impl Default for EmbeddedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillSource for EmbeddedSource {
    fn build(&self, entry: &SkillEntry) -> Result<Skill> {
        match entry.module.as_deref() {
            Some("hello") => Ok(hello(entry)),
            Some("ping") => Ok(ping(entry)),
            Some(other) => Err(Error::Config(format!("Unknown skill module: {}", other))),
            None => self.scripts.build(entry),
        }
    }
}

/// Greets back and keeps a running count of greetings in memory.
fn hello(entry: &SkillEntry) -> Skill {
    Skill::builder(&entry.name)
        .config(entry.config.clone())
        .matcher(Matcher::regex_with(
            r"\b(hi|hello|hey)\b",
            false,
            MatchCondition::Search,
            0.6,
        ))
        .on_event(|ctx, event| async move {
            let greeted = ctx
                .memory()
                .get("hello:greetings")
                .await
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                + 1;
            ctx.memory().put("hello:greetings", json!(greeted)).await;
            let user = if event.user.is_empty() { "there" } else { event.user.as_str() };
            ctx.respond(event.response(&format!("Hi {}!", user))).await;
            Ok(())
        })
        .build()
}

/// Answers pong to a chat ping or a `/skill/<name>/ping` webhook call.
fn ping(entry: &SkillEntry) -> Skill {
    Skill::builder(&entry.name)
        .config(entry.config.clone())
        .matcher(Matcher::regex_with("ping", false, MatchCondition::FullMatch, 0.6))
        .matcher(Matcher::webhook("ping"))
        .on_event(|ctx, event| async move {
            ctx.respond(event.response("pong")).await;
            Ok(())
        })
        .build()
}
