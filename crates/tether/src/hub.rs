//! Event hub: fan-out from the core's event stream to transport
//! connections.
//!
//! Transports register a connection, subscribe it to the sessions it cares
//! about, and receive only those sessions' events on their own channel. The
//! hub never blocks the core: a connection that stops draining its channel
//! just starts dropping events.

use std::collections::HashSet;

use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::mpsc;
use uuid::Uuid;

use tether_protocol::events::SessionEvent;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

pub struct EventHub {
    /// Connection ID -> its sender.
    connections: DashMap<String, mpsc::Sender<SessionEvent>>,

    /// Session ID -> set of subscribed connection IDs.
    session_subscribers: DashMap<String, HashSet<String>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            session_subscribers: DashMap::new(),
        }
    }

    /// Register a new transport connection. Returns its id and the receiver
    /// to drain.
    pub fn register_connection(&self) -> (String, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let conn_id = Uuid::new_v4().to_string();
        self.connections.insert(conn_id.clone(), tx);
        info!("Registered transport connection {}", conn_id);
        (conn_id, rx)
    }

    /// Unregister a connection and all its subscriptions.
    pub fn unregister_connection(&self, conn_id: &str) {
        self.connections.remove(conn_id);
        for mut entry in self.session_subscribers.iter_mut() {
            entry.value_mut().remove(conn_id);
        }
        self.session_subscribers.retain(|_, subs| !subs.is_empty());
        info!("Unregistered transport connection {}", conn_id);
    }

    /// Subscribe a connection to a session's events.
    pub fn subscribe_session(&self, conn_id: &str, session_id: &str) {
        self.session_subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
        debug!("Connection {} subscribed to session {}", conn_id, session_id);
    }

    /// Unsubscribe a connection from a session.
    pub fn unsubscribe_session(&self, conn_id: &str, session_id: &str) {
        if let Some(mut subs) = self.session_subscribers.get_mut(session_id) {
            subs.remove(conn_id);
        }
        self.session_subscribers.retain(|_, subs| !subs.is_empty());
    }

    pub fn is_subscribed(&self, conn_id: &str, session_id: &str) -> bool {
        self.session_subscribers
            .get(session_id)
            .map(|subs| subs.contains(conn_id))
            .unwrap_or(false)
    }

    /// Deliver an event to every connection subscribed to its session.
    /// Slow connections lose events rather than stalling the core.
    pub fn dispatch(&self, event: &SessionEvent) {
        let Some(subs) = self.session_subscribers.get(&event.session_id) else {
            return;
        };
        for conn_id in subs.iter() {
            if let Some(tx) = self.connections.get(conn_id) {
                if tx.try_send(event.clone()).is_err() {
                    debug!(
                        "Dropping event for lagging connection {} (session {})",
                        conn_id, event.session_id
                    );
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::events::EventPayload;

    fn event(session_id: &str) -> SessionEvent {
        SessionEvent::new(
            session_id,
            EventPayload::ProcessStderr {
                line: "x".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_subscription() {
        let hub = EventHub::new();
        let (conn_a, mut rx_a) = hub.register_connection();
        let (_conn_b, mut rx_b) = hub.register_connection();

        hub.subscribe_session(&conn_a, "s1");
        hub.dispatch(&event("s1"));
        hub.dispatch(&event("s2"));

        assert_eq!(rx_a.recv().await.unwrap().session_id, "s1");
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = EventHub::new();
        let (conn, mut rx) = hub.register_connection();
        hub.subscribe_session(&conn, "s1");
        assert!(hub.is_subscribed(&conn, "s1"));

        hub.unsubscribe_session(&conn, "s1");
        hub.dispatch(&event("s1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_cleans_subscriptions() {
        let hub = EventHub::new();
        let (conn, _rx) = hub.register_connection();
        hub.subscribe_session(&conn, "s1");

        hub.unregister_connection(&conn);
        assert_eq!(hub.connection_count(), 0);
        assert!(!hub.is_subscribed(&conn, "s1"));
    }
}
