//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};

use crate::experiment::matching::Role;
use crate::experiment::stage::ParticipantEvent;
use crate::experiment::{Ecu, ParticipantId};

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Participant finished the current stage
    Done,

    /// Bidder's offer to the respondent (0..=100)
    Offer { value: u64 },

    /// Respondent's answer to the pending offer
    Response { accept: bool },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

impl ClientMsg {
    /// Session-bound event carried by this message, if any
    pub fn into_event(self) -> Option<ParticipantEvent> {
        match self {
            ClientMsg::Done => Some(ParticipantEvent::Done),
            ClientMsg::Offer { value } => Some(ParticipantEvent::Offer { value }),
            ClientMsg::Response { accept } => Some(ParticipantEvent::Response { accept }),
            ClientMsg::Ping { .. } => None,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        participant: ParticipantId,
        server_time: u64,
    },

    /// Not enough participants to enter the next stage yet
    Waiting { connected: usize, required: usize },

    /// A stage (or a new round of it) has been entered
    StageStarted { stage: String, round: u32 },

    /// Role for the current round
    RoleAssigned {
        round: u32,
        role: Role,
        /// Counterpart participant (absent when sitting out)
        other: Option<ParticipantId>,
    },

    /// Offer relayed to the respondent
    OfferMade { from: ParticipantId, value: u64 },

    /// Outcome of a bidder/respondent exchange
    RoundResult {
        round: u32,
        accepted: bool,
        offer: u64,
        /// Amount credited to the receiving participant
        win: Ecu,
    },

    /// A participant came back
    ParticipantConnected { participant: ParticipantId },

    /// A participant dropped
    ParticipantDisconnected { participant: ParticipantId },

    /// Session terminates unless the group recovers in time
    Countdown { seconds_remaining: u64 },

    /// Navigate away (unauthorized or terminated)
    Redirect { url: String },

    /// Final accumulated win
    Win { amount: Ecu },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_tagged() {
        let msg: ClientMsg = serde_json::from_str(r#"{"type":"offer","value":40}"#).unwrap();
        assert_eq!(msg, ClientMsg::Offer { value: 40 });

        let msg: ClientMsg = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(msg, ClientMsg::Done);
    }

    #[test]
    fn ping_stays_on_the_connection() {
        assert_eq!(ClientMsg::Ping { t: 7 }.into_event(), None);
        assert_eq!(
            ClientMsg::Response { accept: true }.into_event(),
            Some(ParticipantEvent::Response { accept: true })
        );
    }

    #[test]
    fn role_serializes_snake_case() {
        let msg = ServerMsg::RoleAssigned {
            round: 1,
            role: Role::SitOut,
            other: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "role_assigned");
        assert_eq!(json["role"], "sit_out");
    }
}
