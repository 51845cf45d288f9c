//! Shell connector: stdin in, stdout out.
//!
//! Meant for local development. Every non-empty stdin line becomes a message
//! event; outbound messages print to stdout.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use courier_core::config::ConnectorEntry;
use courier_core::{Event, EventKind, Result};

use crate::queue::EventSink;
use crate::Connector;

const CAPABILITIES: &[EventKind] = &[EventKind::Message];

#[derive(Debug)]
pub struct ShellConnector {
    name: String,
    default: bool,
    user: String,
}

impl ShellConnector {
    pub fn from_entry(entry: &ConnectorEntry) -> Self {
        let user = entry
            .extra
            .get("user")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "user".to_string()));
        Self {
            name: entry.name.clone(),
            default: entry.default,
            user,
        }
    }

    async fn prompt(&self) {
        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(format!("{}> ", self.name).as_bytes()).await;
        let _ = stdout.flush().await;
    }
}

#[async_trait]
impl Connector for ShellConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_default(&self) -> bool {
        self.default
    }

    fn capabilities(&self) -> &[EventKind] {
        CAPABILITIES
    }

    async fn connect(&self) -> Result<()> {
        info!(connector = %self.name, user = %self.user, "Shell connector ready");
        Ok(())
    }

    async fn listen(&self, sink: EventSink, shutdown: broadcast::Receiver<()>) {
        let mut shutdown = shutdown;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        self.prompt().await;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let text = line.trim();
                            if !text.is_empty() {
                                let event = Event::message(&self.name, &self.name, &self.user, text);
                                if let Err(e) = sink.push(event).await {
                                    error!(error = %e, "Failed to queue shell input");
                                    break;
                                }
                            }
                            self.prompt().await;
                        }
                        Ok(None) => {
                            info!("Shell input closed");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to read shell input");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shell connector shutting down");
                    break;
                }
            }
        }
    }

    async fn send(&self, event: &Event) -> Result<()> {
        let text = match event.text() {
            Some(text) => text,
            None => {
                debug!(kind = %event.kind(), "Shell cannot render this event kind");
                return Ok(());
            }
        };
        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("{}\n", text).as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
