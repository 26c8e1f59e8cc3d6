//! Endpoint events for external observers.
//!
//! Published on a broadcast channel; with no subscriber, events are simply
//! dropped.

use crate::connection::ConnectionId;
use chrono::{DateTime, Utc};
use tether_types::EndpointId;
use tokio::sync::broadcast;

/// Capacity of the event channel; slow observers see `Lagged`.
pub const EVENT_CAPACITY: usize = 1024;

/// What happened on an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEventKind {
    ConnectionOpened {
        conn: ConnectionId,
        peer: EndpointId,
        peer_name: String,
    },
    ConnectionClosed {
        conn: ConnectionId,
        reason: String,
    },
    CallSent {
        conn: ConnectionId,
        corr: u64,
        object: u64,
        action: u32,
    },
    CallCompleted {
        conn: ConnectionId,
        corr: u64,
        ok: bool,
    },
    ServiceRegistered {
        name: String,
        route: u64,
    },
    ServiceUnregistered {
        name: String,
    },
}

/// A timestamped event.
#[derive(Debug, Clone)]
pub struct EndpointEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EndpointEventKind,
}

/// Sender side of the endpoint's event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EndpointEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, kind: EndpointEventKind) {
        // No receivers is not an error.
        let _ = self.sender.send(EndpointEvent {
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        bus.publish(EndpointEventKind::ServiceUnregistered { name: "lost".into() });
        let mut rx = bus.subscribe();
        bus.publish(EndpointEventKind::ServiceRegistered {
            name: "svc".into(),
            route: 1,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            EndpointEventKind::ServiceRegistered {
                name: "svc".into(),
                route: 1
            }
        );
    }
}
