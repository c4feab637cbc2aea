//! Per-participant outbound channels

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::experiment::ParticipantId;

use super::protocol::ServerMsg;

/// Outbound buffer per connection
const OUTBOUND_BUFFER: usize = 64;

/// Fire-and-forget delivery used by sessions. No delivery guarantee.
pub trait Transport: Send + Sync {
    fn send_to(&self, participant: &ParticipantId, msg: ServerMsg);

    fn broadcast(&self, participants: &[ParticipantId], msg: ServerMsg) {
        for participant in participants {
            self.send_to(participant, msg.clone());
        }
    }

    fn redirect(&self, participant: &ParticipantId, destination: &str) {
        self.send_to(
            participant,
            ServerMsg::Redirect {
                url: destination.to_string(),
            },
        );
    }
}

struct Connection {
    token: Uuid,
    tx: mpsc::Sender<ServerMsg>,
}

/// Routes server messages to live WebSocket writers
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<ParticipantId, Connection>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one for the participant
    pub fn register(&self, participant: ParticipantId) -> (Uuid, mpsc::Receiver<ServerMsg>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let token = Uuid::new_v4();
        if self
            .connections
            .insert(participant.clone(), Connection { token, tx })
            .is_some()
        {
            debug!(participant = %participant, "Replaced existing connection");
        }
        (token, rx)
    }

    /// Remove a connection unless a newer one has taken its place
    pub fn unregister(&self, participant: &ParticipantId, token: Uuid) -> bool {
        self.connections
            .remove_if(participant, |_, conn| conn.token == token)
            .is_some()
    }

    pub fn is_connected(&self, participant: &ParticipantId) -> bool {
        self.connections.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

impl Transport for ConnectionHub {
    fn send_to(&self, participant: &ParticipantId, msg: ServerMsg) {
        let Some(conn) = self.connections.get(participant) else {
            debug!(participant = %participant, "Dropping message for offline participant");
            return;
        };

        if let Err(e) = conn.tx.try_send(msg) {
            warn!(participant = %participant, error = %e, "Outbound message dropped");
        }
    }
}

/// Test double that records everything sent
#[cfg(test)]
#[derive(Default)]
pub struct RecordingTransport {
    sent: parking_lot::Mutex<Vec<(ParticipantId, ServerMsg)>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn sent(&self) -> Vec<(ParticipantId, ServerMsg)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, participant: &ParticipantId) -> Vec<ServerMsg> {
        self.sent
            .lock()
            .iter()
            .filter(|(p, _)| p == participant)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[cfg(test)]
impl Transport for RecordingTransport {
    fn send_to(&self, participant: &ParticipantId, msg: ServerMsg) {
        self.sent.lock().push((participant.clone(), msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_connection_does_not_unregister_newer_one() {
        let hub = ConnectionHub::new();
        let pid = ParticipantId::new("p1");

        let (old_token, _old_rx) = hub.register(pid.clone());
        let (new_token, mut new_rx) = hub.register(pid.clone());

        assert!(!hub.unregister(&pid, old_token));
        assert!(hub.is_connected(&pid));

        hub.send_to(&pid, ServerMsg::Pong { t: 1 });
        assert_eq!(new_rx.recv().await, Some(ServerMsg::Pong { t: 1 }));

        assert!(hub.unregister(&pid, new_token));
        assert_eq!(hub.len(), 0);
    }

    #[test]
    fn redirect_sends_redirect_message() {
        let transport = RecordingTransport::default();
        let pid = ParticipantId::new("p1");
        transport.redirect(&pid, "/unauth.htm");
        assert_eq!(
            transport.sent_to(&pid),
            vec![ServerMsg::Redirect {
                url: "/unauth.htm".to_string()
            }]
        );
    }
}
