use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use courier_core::{MatcherKind, Result};
use courier_storage::Memory;

use crate::context::{OutboundPort, SkillContext};
use crate::skill::Skill;

/// Every loaded skill, in registration order.
///
/// Ranking ties break on that order, so `all()` preserves it. Shared as
/// `Arc<RwLock<SkillRegistry>>`: reads on every dispatch, writes only during
/// load and reload.
#[derive(Default)]
pub struct SkillRegistry {
    skills: Vec<Arc<Skill>>,
    index: HashMap<String, usize>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill and return the name it ended up with. A taken name
    /// is rewritten to `name_N`; a config that fails the declared schema
    /// rejects the skill without touching the registry.
    pub fn register(&mut self, mut skill: Skill) -> Result<String> {
        if let Err(e) = skill.validate_config() {
            error!(skill = %skill.name, error = %e, "Rejected skill with invalid config");
            return Err(e);
        }
        let effective = self.free_name(&skill.name);
        if effective != skill.name {
            warn!(requested = %skill.name, assigned = %effective, "Skill name taken, renamed");
            skill.name = effective.clone();
        }
        self.index.insert(effective.clone(), self.skills.len());
        self.skills.push(Arc::new(skill));
        info!(skill = %effective, "Registered skill");
        Ok(effective)
    }

    fn free_name(&self, requested: &str) -> String {
        if !self.index.contains_key(requested) {
            return requested.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}_{}", requested, n);
            if !self.index.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<Skill>> {
        let at = self.index.remove(name)?;
        let skill = self.skills.remove(at);
        self.index.clear();
        for (i, s) in self.skills.iter().enumerate() {
            self.index.insert(s.name.clone(), i);
        }
        Some(skill)
    }

    pub fn clear(&mut self) {
        self.skills.clear();
        self.index.clear();
    }

    /// All skills in registration order.
    pub fn all(&self) -> &[Arc<Skill>] {
        &self.skills
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Skill>> {
        self.index.get(name).map(|&at| self.skills[at].clone())
    }

    /// Skills carrying at least one matcher of `kind`.
    pub fn with_matcher_kind(&self, kind: MatcherKind) -> Vec<Arc<Skill>> {
        self.skills
            .iter()
            .filter(|s| s.has_matcher_kind(kind))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Run every setup hook once, in registration order. A failing hook is
    /// logged and skipped; the skill stays registered.
    pub async fn run_setup(&self, outbound: &Arc<dyn OutboundPort>, memory: &Arc<Memory>) {
        for skill in &self.skills {
            if let Some(hook) = skill.setup_hook() {
                let ctx = SkillContext::new(
                    &skill.name,
                    skill.config.clone(),
                    outbound.clone(),
                    memory.clone(),
                );
                if let Err(e) = hook.run(ctx).await {
                    error!(skill = %skill.name, error = %e, "Skill setup failed");
                }
            }
        }
    }

    /// Run every teardown hook, in registration order. Invoked before the
    /// registry is dropped on shutdown or rebuilt on reload.
    pub async fn run_teardown(&self, outbound: &Arc<dyn OutboundPort>, memory: &Arc<Memory>) {
        for skill in &self.skills {
            if let Some(hook) = skill.teardown_hook() {
                let ctx = SkillContext::new(
                    &skill.name,
                    skill.config.clone(),
                    outbound.clone(),
                    memory.clone(),
                );
                if let Err(e) = hook.run(ctx).await {
                    warn!(skill = %skill.name, error = %e, "Skill teardown failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::{FieldKind, FieldSpec};
    use courier_core::Matcher;

    fn named(name: &str) -> Skill {
        Skill::builder(name).matcher(Matcher::regex("x")).build()
    }

    #[test]
    fn duplicate_names_get_numeric_suffixes() {
        let mut reg = SkillRegistry::new();
        assert_eq!(reg.register(named("greet")).unwrap(), "greet");
        assert_eq!(reg.register(named("greet")).unwrap(), "greet_1");
        assert_eq!(reg.register(named("greet")).unwrap(), "greet_2");
        assert!(reg.by_name("greet_1").is_some());
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn invalid_config_rejects_the_skill() {
        let mut reg = SkillRegistry::new();
        let skill = Skill::builder("fetch")
            .matcher(Matcher::regex("fetch"))
            .schema(vec![FieldSpec::required("url", FieldKind::String)])
            .config(serde_json::json!({}))
            .build();
        assert!(reg.register(skill).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn wrong_field_type_rejects_the_skill() {
        let mut reg = SkillRegistry::new();
        let skill = Skill::builder("fetch")
            .schema(vec![FieldSpec::required("url", FieldKind::String)])
            .config(serde_json::json!({"url": 5}))
            .build();
        assert!(reg.register(skill).is_err());
        assert!(reg.by_name("fetch").is_none());
    }

    #[test]
    fn with_matcher_kind_filters() {
        let mut reg = SkillRegistry::new();
        reg.register(
            Skill::builder("daily")
                .matcher(Matcher::crontab("0 9 * * *"))
                .build(),
        )
        .unwrap();
        reg.register(named("echo")).unwrap();

        let crons = reg.with_matcher_kind(MatcherKind::Crontab);
        assert_eq!(crons.len(), 1);
        assert_eq!(crons[0].name, "daily");
        assert!(reg.with_matcher_kind(MatcherKind::Webhook).is_empty());
    }

    #[test]
    fn registration_order_is_preserved() {
        let mut reg = SkillRegistry::new();
        reg.register(named("b")).unwrap();
        reg.register(named("a")).unwrap();
        reg.register(named("c")).unwrap();
        let order: Vec<_> = reg.all().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, ["b", "a", "c"]);
    }

    #[test]
    fn unregister_reindexes_survivors() {
        let mut reg = SkillRegistry::new();
        reg.register(named("a")).unwrap();
        reg.register(named("b")).unwrap();
        reg.register(named("c")).unwrap();

        assert!(reg.unregister("b").is_some());
        assert!(reg.unregister("b").is_none());
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.by_name("c").unwrap().name, "c");
    }

    #[tokio::test]
    async fn setup_hooks_run_once_per_skill() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        use courier_core::Event;

        struct NullOutbound;

        #[async_trait::async_trait]
        impl OutboundPort for NullOutbound {
            async fn deliver(&self, _event: Event) -> Result<()> {
                Ok(())
            }
        }

        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        let skill = Skill::builder("boot")
            .on_setup(move |_ctx| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();

        let mut reg = SkillRegistry::new();
        reg.register(skill).unwrap();
        reg.register(named("plain")).unwrap();

        let outbound: Arc<dyn OutboundPort> = Arc::new(NullOutbound);
        let memory = Arc::new(Memory::empty());
        reg.run_setup(&outbound, &memory).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
