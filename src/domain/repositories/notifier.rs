use crate::domain::entities::events::PositionEvent;
use async_trait::async_trait;

/// Fire-and-forget sink for lifecycle events.
///
/// Delivery failures are the sink's problem: they are logged, never propagated,
/// and never undo the ledger mutation that produced the event.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: PositionEvent);
}
