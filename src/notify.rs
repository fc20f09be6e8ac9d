//! Client notification port.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Messages broadcast to connected clients. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
  /// A write was queued while offline
  #[serde(rename = "offline-queue-updated")]
  QueueUpdated { queue_size: usize },
  /// A replay pass submitted at least one queued write
  #[serde(rename = "offline-sync-completed")]
  SyncCompleted {
    synced_count: usize,
    remaining_count: usize,
  },
  /// The server rejected a replayed write; the entry stays queued
  #[serde(rename = "offline-replay-rejected")]
  ReplayRejected { url: String, status: u16 },
  /// A write hit the replay attempt cap and was moved out of the queue
  #[serde(rename = "offline-dead-lettered")]
  DeadLettered { url: String, attempts: u32 },
}

impl ClientEvent {
  pub fn kind(&self) -> &'static str {
    match self {
      Self::QueueUpdated { .. } => "offline-queue-updated",
      Self::SyncCompleted { .. } => "offline-sync-completed",
      Self::ReplayRejected { .. } => "offline-replay-rejected",
      Self::DeadLettered { .. } => "offline-dead-lettered",
    }
  }
}

/// Anything that can deliver client events.
pub trait Notifier: Send + Sync {
  fn notify(&self, event: ClientEvent);
}

/// Notifier backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastNotifier {
  tx: broadcast::Sender<ClientEvent>,
}

impl BroadcastNotifier {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
    self.tx.subscribe()
  }
}

impl Notifier for BroadcastNotifier {
  fn notify(&self, event: ClientEvent) {
    debug!(kind = event.kind(), "Notifying clients");
    // No subscribers is fine
    let _ = self.tx.send(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_wire_format() {
    let event = ClientEvent::SyncCompleted {
      synced_count: 1,
      remaining_count: 0,
    };
    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      serde_json::json!({
        "type": "offline-sync-completed",
        "data": { "syncedCount": 1, "remainingCount": 0 }
      })
    );

    let event = ClientEvent::QueueUpdated { queue_size: 3 };
    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      serde_json::json!({ "type": "offline-queue-updated", "data": { "queueSize": 3 } })
    );

    let event = ClientEvent::ReplayRejected {
      url: "https://x.supabase.co/rest/v1/todos".to_string(),
      status: 409,
    };
    assert_eq!(serde_json::to_value(&event).unwrap()["type"], event.kind());
  }

  #[tokio::test]
  async fn test_broadcast_reaches_subscribers() {
    let notifier = BroadcastNotifier::new(8);
    let mut rx = notifier.subscribe();

    notifier.notify(ClientEvent::QueueUpdated { queue_size: 1 });

    assert_eq!(rx.recv().await.unwrap(), ClientEvent::QueueUpdated { queue_size: 1 });
  }

  #[test]
  fn test_notify_without_subscribers_is_silent() {
    BroadcastNotifier::new(1).notify(ClientEvent::QueueUpdated { queue_size: 1 });
  }
}
