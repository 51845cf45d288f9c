use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use courier_core::{Event, Result};
use courier_storage::Memory;

/// Outbound side of the connector manager as running skills see it.
#[async_trait]
pub trait OutboundPort: Send + Sync {
    /// Deliver an outbound event through the connector named by
    /// `event.connector`; an empty name routes to the default connector.
    async fn deliver(&self, event: Event) -> Result<()>;
}

/// Per-invocation surface a handler gets: the reply path, shared memory and
/// the skill's own config.
#[derive(Clone)]
pub struct SkillContext {
    skill_name: Arc<str>,
    config: Arc<Value>,
    outbound: Arc<dyn OutboundPort>,
    memory: Arc<Memory>,
}

impl SkillContext {
    pub fn new(
        skill_name: &str,
        config: Value,
        outbound: Arc<dyn OutboundPort>,
        memory: Arc<Memory>,
    ) -> Self {
        Self {
            skill_name: Arc::from(skill_name),
            config: Arc::new(config),
            outbound,
            memory,
        }
    }

    pub fn skill_name(&self) -> &str {
        &self.skill_name
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Submit an outbound event and await delivery. Failures are logged and
    /// reported as `false` so skill code can branch without unwinding.
    pub async fn respond(&self, event: Event) -> bool {
        match self.outbound.deliver(event).await {
            Ok(()) => true,
            Err(e) => {
                error!(skill = %self.skill_name, error = %e, "Failed to deliver response");
                false
            }
        }
    }
}
