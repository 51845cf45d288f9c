//! Connector lifecycle and event fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use courier_core::{Error, Event, Result};

use crate::queue::{EventSink, InboundQueue};
use crate::Connector;

/// How long one connector may take to connect before it is given up on.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct ConnectorManager {
    connectors: Vec<Arc<dyn Connector>>,
    by_name: HashMap<String, usize>,
    default_index: usize,
    connected: RwLock<HashSet<String>>,
    queue: Arc<InboundQueue>,
}

impl ConnectorManager {
    /// The default connector is the first declared with `default: true`,
    /// else the first registered.
    pub fn new(connectors: Vec<Arc<dyn Connector>>) -> Result<Self> {
        if connectors.is_empty() {
            return Err(Error::Config("No connectors configured".to_string()));
        }
        let mut by_name = HashMap::new();
        for (index, connector) in connectors.iter().enumerate() {
            if by_name.insert(connector.name().to_string(), index).is_some() {
                return Err(Error::Config(format!(
                    "Duplicate connector name: {}",
                    connector.name()
                )));
            }
        }
        let default_index = connectors
            .iter()
            .position(|c| c.is_default())
            .unwrap_or(0);
        for connector in connectors.iter().skip(default_index + 1) {
            if connector.is_default() {
                warn!(
                    connector = %connector.name(),
                    default = %connectors[default_index].name(),
                    "Extra default connector ignored"
                );
            }
        }
        Ok(Self {
            connectors,
            by_name,
            default_index,
            connected: RwLock::new(HashSet::new()),
            queue: Arc::new(InboundQueue::new()),
        })
    }

    pub fn queue(&self) -> Arc<InboundQueue> {
        Arc::clone(&self.queue)
    }

    pub fn default_connector(&self) -> &str {
        self.connectors[self.default_index].name()
    }

    pub fn names(&self) -> Vec<String> {
        self.connectors.iter().map(|c| c.name().to_string()).collect()
    }

    /// Connects every connector concurrently and spawns a listener per
    /// success. Connectors that fail or time out are dropped with an error
    /// log; start fails only when none survive.
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> Result<Vec<JoinHandle<()>>> {
        let attempts = join_all(self.connectors.iter().map(|connector| async move {
            match tokio::time::timeout(CONNECT_TIMEOUT, connector.connect()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!(connector = %connector.name(), error = %e, "Connector failed to connect");
                    false
                }
                Err(_) => {
                    error!(
                        connector = %connector.name(),
                        timeout_secs = CONNECT_TIMEOUT.as_secs(),
                        "Connector timed out while connecting"
                    );
                    false
                }
            }
        }))
        .await;

        let mut handles = Vec::new();
        let mut connected = self.connected.write().await;
        for (connector, ok) in self.connectors.iter().zip(attempts) {
            if !ok {
                continue;
            }
            connected.insert(connector.name().to_string());
            let sink = EventSink::new(connector.name(), connector.capabilities(), self.queue());
            let receiver = shutdown.subscribe();
            let connector = Arc::clone(connector);
            handles.push(tokio::spawn(async move {
                connector.listen(sink, receiver).await;
            }));
        }
        if handles.is_empty() {
            return Err(Error::Transport("No connector could connect".to_string()));
        }
        info!(
            connected = handles.len(),
            configured = self.connectors.len(),
            default = %self.default_connector(),
            "Connectors started"
        );
        Ok(handles)
    }

    /// Routes `event` to its connector; an empty name means the default.
    pub async fn send(&self, event: &Event) -> Result<()> {
        let name = if event.connector.is_empty() {
            self.default_connector()
        } else {
            event.connector.as_str()
        };
        let index = *self
            .by_name
            .get(name)
            .ok_or_else(|| Error::Transport(format!("No such connector: {}", name)))?;
        if !self.connected.read().await.contains(name) {
            return Err(Error::Transport(format!("Connector {} is not connected", name)));
        }
        self.connectors[index].send(event).await
    }

    /// Disconnects every connected connector concurrently.
    pub async fn stop(&self) {
        let connected = self.connected.read().await.clone();
        join_all(
            self.connectors
                .iter()
                .filter(|c| connected.contains(c.name()))
                .map(|connector| async move {
                    if let Err(e) = connector.disconnect().await {
                        warn!(connector = %connector.name(), error = %e, "Connector failed to disconnect");
                    }
                }),
        )
        .await;
        self.connected.write().await.clear();
        info!("Connectors stopped");
    }
}
