//! Notification sinks for position lifecycle events.

use crate::domain::entities::events::PositionEvent;
use crate::domain::repositories::notifier::Notifier;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Writes every event to the tracing log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: PositionEvent) {
        match &event {
            PositionEvent::Inconsistency { .. } => warn!("📣 {}", event.summary()),
            _ => info!("📣 {}", event.summary()),
        }
    }
}

/// Forwards events to a bounded channel, e.g. for a UI or a chat bridge.
///
/// A full or closed channel drops the event with a warning.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<PositionEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PositionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: PositionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Dropping notification: {}", e);
        }
    }
}
