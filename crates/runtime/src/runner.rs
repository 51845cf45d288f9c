//! Skill execution. One handler failing, hanging or panicking must never
//! take the dispatch loop with it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use courier_connectors::ConnectorManager;
use courier_core::{Event, Result};
use courier_skills::{OutboundPort, Skill, SkillContext};
use courier_storage::Memory;

use crate::metrics::Metrics;

/// Routes skill responses out through the connector manager.
pub struct ConnectorOutbound {
    manager: Arc<ConnectorManager>,
}

impl ConnectorOutbound {
    pub fn new(manager: Arc<ConnectorManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl OutboundPort for ConnectorOutbound {
    async fn deliver(&self, event: Event) -> Result<()> {
        self.manager.send(&event).await
    }
}

/// Runs one handler per call under the skill's deadline, behind a panic
/// barrier.
pub struct SkillRunner {
    outbound: Arc<dyn OutboundPort>,
    memory: Arc<Memory>,
    metrics: Arc<Metrics>,
}

impl SkillRunner {
    pub fn new(
        outbound: Arc<dyn OutboundPort>,
        memory: Arc<Memory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { outbound, memory, metrics }
    }

    /// Run in the background; the handle is for shutdown accounting only.
    pub fn spawn(self: &Arc<Self>, skill: Arc<Skill>, event: Event) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.run(skill, event).await })
    }

    /// Run one handler to completion. Timeouts, errors and panics are
    /// logged against the skill and event id; nothing reaches the caller.
    pub async fn run(&self, skill: Arc<Skill>, event: Event) {
        let started = Instant::now();
        let event_id = event.id;
        self.metrics.record_skill_run(&skill.name);
        let ctx = SkillContext::new(
            &skill.name,
            skill.config.clone(),
            Arc::clone(&self.outbound),
            Arc::clone(&self.memory),
        );
        let handler = skill.handler();
        // The nested task is the panic barrier: an unwinding handler comes
        // back as a JoinError instead of tearing down this loop.
        let mut task = tokio::spawn(async move { handler.call(ctx, event).await });
        let joined = match skill.timeout_secs() {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        task.abort();
                        error!(
                            skill = %skill.name,
                            event = %event_id,
                            timeout_secs = secs,
                            "Skill handler hit its deadline, aborted"
                        );
                        return;
                    }
                }
            }
            None => (&mut task).await,
        };
        match joined {
            Ok(Ok(())) => {
                self.metrics.record_response(started.elapsed());
                debug!(
                    skill = %skill.name,
                    event = %event_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Skill finished"
                );
            }
            Ok(Err(e)) => {
                error!(skill = %skill.name, event = %event_id, error = %e, "Skill failed");
            }
            Err(e) if e.is_panic() => {
                error!(skill = %skill.name, event = %event_id, "Skill panicked");
            }
            Err(_) => {
                debug!(skill = %skill.name, event = %event_id, "Skill task cancelled");
            }
        }
    }
}
