use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_core::{Error, Event, Matcher, MatcherKind, Result};

use crate::context::SkillContext;

/// Handler invoked when a skill is selected for an event.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: SkillContext, event: Event) -> Result<()>;
}

/// Adapter so a plain async closure can act as a handler.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(SkillContext, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: SkillContext, event: Event) -> Result<()> {
        (self.0)(ctx, event).await
    }
}

/// Lifecycle hook run after registration (setup) or before removal
/// (teardown).
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, ctx: SkillContext) -> Result<()>;
}

pub struct FnHook<F>(F);

impl<F> FnHook<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Hook for FnHook<F>
where
    F: Fn(SkillContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: SkillContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn call(&self, _ctx: SkillContext, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Declared shape of one skill config field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self { name: name.to_string(), required: true, kind }
    }

    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self { name: name.to_string(), required: false, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    String,
    Bool,
    Int,
    Float,
    List,
    Map,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Int => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_number(),
            FieldKind::List => value.is_array(),
            FieldKind::Map => value.is_object(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Bool => "bool",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::List => "list",
            FieldKind::Map => "map",
        }
    }
}

/// A loaded skill: matcher descriptors plus the handler they route to.
///
/// Names are unique only after registration; the registry rewrites
/// duplicates. `config` is an arbitrary JSON mapping handed to the handler
/// through the context, optionally validated against `schema`.
pub struct Skill {
    pub name: String,
    pub config: Value,
    pub matchers: Vec<Matcher>,
    pub schema: Option<Vec<FieldSpec>>,
    handler: Arc<dyn Handler>,
    setup: Option<Arc<dyn Hook>>,
    teardown: Option<Arc<dyn Hook>>,
}

impl Skill {
    pub fn builder(name: &str) -> SkillBuilder {
        SkillBuilder {
            name: name.to_string(),
            config: Value::Null,
            matchers: Vec::new(),
            schema: None,
            handler: None,
            setup: None,
            teardown: None,
        }
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }

    pub fn setup_hook(&self) -> Option<Arc<dyn Hook>> {
        self.setup.clone()
    }

    pub fn teardown_hook(&self) -> Option<Arc<dyn Hook>> {
        self.teardown.clone()
    }

    /// Per-skill execution deadline in seconds, from the `timeout` config
    /// key. None runs the handler without a deadline.
    pub fn timeout_secs(&self) -> Option<u64> {
        self.config.get("timeout").and_then(Value::as_u64)
    }

    pub fn has_matcher_kind(&self, kind: MatcherKind) -> bool {
        self.matchers.iter().any(|m| m.kind() == kind)
    }

    /// Check `config` against the declared schema, if any.
    pub fn validate_config(&self) -> Result<()> {
        let schema = match &self.schema {
            Some(schema) if !schema.is_empty() => schema,
            _ => return Ok(()),
        };
        let fields = match &self.config {
            Value::Object(map) => map,
            Value::Null => {
                if let Some(spec) = schema.iter().find(|f| f.required) {
                    return Err(Error::Schema(format!(
                        "Skill {} config is missing required field {}",
                        self.name, spec.name
                    )));
                }
                return Ok(());
            }
            _ => {
                return Err(Error::Schema(format!(
                    "Skill {} config must be a mapping",
                    self.name
                )))
            }
        };
        for spec in schema {
            match fields.get(&spec.name) {
                None if spec.required => {
                    return Err(Error::Schema(format!(
                        "Skill {} config is missing required field {}",
                        self.name, spec.name
                    )))
                }
                None => {}
                Some(value) => {
                    if !spec.kind.accepts(value) {
                        return Err(Error::Schema(format!(
                            "Skill {} config field {} expects a {}",
                            self.name,
                            spec.name,
                            spec.kind.as_str()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skill")
            .field("name", &self.name)
            .field("matchers", &self.matchers)
            .finish_non_exhaustive()
    }
}

pub struct SkillBuilder {
    name: String,
    config: Value,
    matchers: Vec<Matcher>,
    schema: Option<Vec<FieldSpec>>,
    handler: Option<Arc<dyn Handler>>,
    setup: Option<Arc<dyn Hook>>,
    teardown: Option<Arc<dyn Hook>>,
}

impl SkillBuilder {
    pub fn matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn matchers(mut self, matchers: impl IntoIterator<Item = Matcher>) -> Self {
        self.matchers.extend(matchers);
        self
    }

    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn schema(mut self, fields: Vec<FieldSpec>) -> Self {
        self.schema = Some(fields);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn on_event<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SkillContext, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handler = Some(Arc::new(FnHandler::new(f)));
        self
    }

    pub fn on_setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SkillContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.setup = Some(Arc::new(FnHook::new(f)));
        self
    }

    pub fn on_teardown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SkillContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.teardown = Some(Arc::new(FnHook::new(f)));
        self
    }

    pub fn build(self) -> Skill {
        Skill {
            name: self.name,
            config: self.config,
            matchers: self.matchers,
            schema: self.schema,
            handler: self.handler.unwrap_or_else(|| Arc::new(NoopHandler)),
            setup: self.setup,
            teardown: self.teardown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<FieldSpec> {
        vec![
            FieldSpec::required("url", FieldKind::String),
            FieldSpec::optional("retries", FieldKind::Int),
        ]
    }

    #[test]
    fn schema_accepts_valid_config() {
        let skill = Skill::builder("fetch")
            .schema(schema())
            .config(serde_json::json!({"url": "https://example.org", "retries": 3}))
            .build();
        assert!(skill.validate_config().is_ok());
    }

    #[test]
    fn schema_rejects_missing_required_field() {
        let skill = Skill::builder("fetch")
            .schema(schema())
            .config(serde_json::json!({"retries": 3}))
            .build();
        let err = skill.validate_config().unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn schema_rejects_wrong_type() {
        let skill = Skill::builder("fetch")
            .schema(schema())
            .config(serde_json::json!({"url": "x", "retries": "lots"}))
            .build();
        assert!(skill.validate_config().is_err());
    }

    #[test]
    fn missing_config_block_needs_no_required_fields() {
        let optional_only = Skill::builder("fetch")
            .schema(vec![FieldSpec::optional("retries", FieldKind::Int)])
            .build();
        assert!(optional_only.validate_config().is_ok());

        let with_required = Skill::builder("fetch").schema(schema()).build();
        assert!(with_required.validate_config().is_err());
    }

    #[test]
    fn timeout_read_from_config() {
        let skill = Skill::builder("slow")
            .config(serde_json::json!({"timeout": 5}))
            .build();
        assert_eq!(skill.timeout_secs(), Some(5));
        assert_eq!(Skill::builder("fast").build().timeout_secs(), None);
    }

    #[tokio::test]
    async fn closure_handler_runs() {
        use std::sync::atomic::{AtomicBool, Ordering};

        use crate::context::{OutboundPort, SkillContext};
        use courier_storage::Memory;

        struct NullOutbound;

        #[async_trait]
        impl OutboundPort for NullOutbound {
            async fn deliver(&self, _event: Event) -> Result<()> {
                Ok(())
            }
        }

        let ran = Arc::new(AtomicBool::new(false));
        let seen = ran.clone();
        let skill = Skill::builder("probe")
            .on_event(move |_ctx, _event| {
                let seen = seen.clone();
                async move {
                    seen.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();

        let ctx = SkillContext::new(
            "probe",
            Value::Null,
            Arc::new(NullOutbound),
            Arc::new(Memory::empty()),
        );
        let event = Event::message("shell", "room", "alice", "hi");
        skill.handler().call(ctx, event).await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
