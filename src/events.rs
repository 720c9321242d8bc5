//! In-process fan-out of import lifecycle events to live subscribers.
//!
//! Each subscriber owns a bounded channel of pre-rendered server-push frames
//! (`event: <name>\ndata: <json>\n\n`). Publishing never waits: a subscriber
//! whose buffer is full is disconnected, and one that has gone away is
//! dropped from the registry on the next publish.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default per-subscriber frame buffer
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Events emitted by the import pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum ImportEvent {
    /// First frame on every new subscription; the id is sent as a string
    Connected { id: String },
    ImportRunStarted {
        run_id: String,
    },
    JobProcessed {
        run_id: String,
        external_id: String,
        was_new: bool,
    },
    JobFailed {
        run_id: String,
        external_id: String,
        reason: String,
    },
}

impl ImportEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ImportEvent::Connected { .. } => "connected",
            ImportEvent::ImportRunStarted { .. } => "importRunStarted",
            ImportEvent::JobProcessed { .. } => "jobProcessed",
            ImportEvent::JobFailed { .. } => "jobFailed",
        }
    }

    /// Render as one server-push frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(self)?;
        Ok(format!("event: {}\ndata: {}\n\n", self.name(), data))
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Live events are disabled")]
    Disabled,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<Arc<str>>>,
}

/// Registry of live subscribers. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct EventBroadcaster {
    registry: Arc<Mutex<Registry>>,
    buffer: usize,
    enabled: bool,
}

impl EventBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            buffer: buffer.max(1),
            enabled: true,
        }
    }

    /// A broadcaster that drops every event and refuses subscribers.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(1)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // Registry state stays consistent across a panicking holder: every
    // critical section is a single map operation.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber. Its first frame is `connected`.
    pub fn subscribe(&self) -> Result<Subscription, EventError> {
        if !self.enabled {
            return Err(EventError::Disabled);
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let id = {
            let mut registry = self.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.subscribers.insert(id, tx.clone());
            id
        };

        // Fresh channel with capacity >= 1, so this cannot be full
        if let Ok(frame) = (ImportEvent::Connected { id: id.to_string() }).to_frame() {
            let _ = tx.try_send(Arc::from(frame));
        }

        tracing::debug!(subscriber = id, "Event subscriber connected");
        Ok(Subscription {
            id,
            rx,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Deliver an event to every connected subscriber without waiting.
    ///
    /// Zero subscribers is a no-op.
    pub fn publish(&self, event: &ImportEvent) {
        if !self.enabled {
            return;
        }

        let mut registry = self.lock();
        if registry.subscribers.is_empty() {
            return;
        }

        let frame: Arc<str> = match event.to_frame() {
            Ok(frame) => Arc::from(frame),
            Err(e) => {
                tracing::warn!(event = event.name(), error = %e, "Failed to encode event");
                return;
            }
        };

        registry.subscribers.retain(|id, tx| match tx.try_send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "Event subscriber too slow, disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = id, "Event subscriber gone");
                false
            }
        });
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// A live subscription. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    registry: Arc<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next frame, or `None` once the broadcaster has disconnected us.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    /// Next frame if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.subscribers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn processed(external_id: &str) -> ImportEvent {
        ImportEvent::JobProcessed {
            run_id: "run-1".to_string(),
            external_id: external_id.to_string(),
            was_new: true,
        }
    }

    #[test]
    fn test_frame_format() {
        let frame = processed("1").to_frame().unwrap();
        assert_eq!(
            frame,
            "event: jobProcessed\ndata: {\"runId\":\"run-1\",\"externalId\":\"1\",\"wasNew\":true}\n\n"
        );

        let failed = ImportEvent::JobFailed {
            run_id: "run-1".to_string(),
            external_id: "2".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(
            failed.to_frame().unwrap(),
            "event: jobFailed\ndata: {\"runId\":\"run-1\",\"externalId\":\"2\",\"reason\":\"boom\"}\n\n"
        );

        let started = ImportEvent::ImportRunStarted {
            run_id: "run-1".to_string(),
        };
        assert_eq!(
            started.to_frame().unwrap(),
            "event: importRunStarted\ndata: {\"runId\":\"run-1\"}\n\n"
        );
    }

    #[tokio::test]
    async fn test_subscriber_gets_connected_then_events() {
        let events = EventBroadcaster::default();
        let mut sub = events.subscribe().unwrap();

        let connected = sub.recv().await.unwrap();
        assert_eq!(
            &*connected,
            format!("event: connected\ndata: {{\"id\":\"{}\"}}\n\n", sub.id())
        );

        events.publish(&processed("1"));
        let frame = sub.recv().await.unwrap();
        assert!(frame.starts_with("event: jobProcessed\n"));
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let events = EventBroadcaster::default();
        let mut a = events.subscribe().unwrap();
        let mut b = events.subscribe().unwrap();
        assert_ne!(a.id(), b.id());

        events.publish(&processed("1"));

        for sub in [&mut a, &mut b] {
            sub.recv().await.unwrap(); // connected
            let frame = sub.recv().await.unwrap();
            assert!(frame.contains("\"externalId\":\"1\""));
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let events = EventBroadcaster::default();
        events.publish(&processed("1"));
        assert_eq!(events.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_unregisters() {
        let events = EventBroadcaster::default();
        let sub = events.subscribe().unwrap();
        assert_eq!(events.subscriber_count(), 1);
        drop(sub);
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_disconnected_without_blocking_others() {
        let events = EventBroadcaster::new(2);
        let mut slow = events.subscribe().unwrap();
        let mut fast = events.subscribe().unwrap();

        // Buffer of 2 holds `connected` plus one event
        events.publish(&processed("1"));
        fast.recv().await.unwrap();
        fast.recv().await.unwrap();

        events.publish(&processed("2"));
        assert_eq!(events.subscriber_count(), 1);

        // The fast subscriber still receives
        let frame = fast.recv().await.unwrap();
        assert!(frame.contains("\"externalId\":\"2\""));

        // The slow one drains what it had, then sees the disconnect
        assert!(slow.recv().await.unwrap().starts_with("event: connected"));
        assert!(slow.recv().await.unwrap().contains("\"externalId\":\"1\""));
        assert!(slow.recv().await.is_none());
    }

    #[test]
    fn test_disabled_refuses_subscribers() {
        let events = EventBroadcaster::disabled();
        assert!(!events.is_enabled());
        assert!(matches!(events.subscribe(), Err(EventError::Disabled)));
        events.publish(&processed("1"));
    }
}
