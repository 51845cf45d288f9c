//! Transports and the inbound event path.
//!
//! A connector bridges one chat transport: it turns transport traffic into
//! events pushed through an [`EventSink`], and delivers outbound events back
//! to the transport. The [`ConnectorManager`] owns the lifecycle and the
//! shared inbound queue.

pub mod manager;
pub mod queue;
pub mod shell;

pub use manager::ConnectorManager;
pub use queue::{EventSink, InboundQueue};
pub use shell::ShellConnector;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use courier_core::config::ConnectorEntry;
use courier_core::{Error, Event, EventKind, Result};

#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Wants to be the default target for events without a connector name.
    fn is_default(&self) -> bool;

    /// Event kinds this transport can carry. Inbound events outside the set
    /// never reach the dispatcher.
    fn capabilities(&self) -> &[EventKind];

    async fn connect(&self) -> Result<()>;

    /// Runs until `shutdown` fires or the transport ends, pushing inbound
    /// events through `sink`.
    async fn listen(&self, sink: EventSink, shutdown: broadcast::Receiver<()>);

    async fn send(&self, event: &Event) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Builds the connector implementation selected by `entry`.
pub fn build_connector(entry: &ConnectorEntry) -> Result<Arc<dyn Connector>> {
    match entry.implementation() {
        "shell" => Ok(Arc::new(ShellConnector::from_entry(entry))),
        other => Err(Error::Config(format!("Unknown connector type: {}", other))),
    }
}
