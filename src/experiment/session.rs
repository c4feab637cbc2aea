//! Per-group session state

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::matching::Role;
use super::{Ecu, ParticipantId};

/// Marker reported as the current stage once a session has ended
pub const ENDED_STAGE: &str = "ended";

/// Session identifier, unique within one generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room-{}", self.0)
    }
}

/// Hands out session ids; owned by whoever constructs sessions
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    next: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Participant record (authoritative, owned by the session)
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub status: ConnectionStatus,
    /// Role for the current round, if matched
    pub role: Option<Role>,
    /// Accumulated outcome, written only from ledger credits
    pub outcome: Ecu,
}

impl Participant {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            status: ConnectionStatus::Connected,
            role: None,
            outcome: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Reached the end of the plot
    Completed,
    /// A disconnection outlived the countdown
    FatalDisconnection,
}

/// Where the session is in its plot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the stage at `stage_index` to become admissible
    AwaitingAdmission,
    /// Stage handler entered, waiting for completion
    InStage,
    Ended(EndReason),
}

/// Mutable record for one group
#[derive(Debug)]
pub struct SessionState {
    pub id: SessionId,
    pub seed: u64,
    pub roster: BTreeMap<ParticipantId, Participant>,
    pub phase: SessionPhase,
    /// Index into the plot of the current stage
    pub stage_index: usize,
    /// 1-based round within the current stage
    pub round: u32,
}

impl SessionState {
    pub fn new(id: SessionId, seed: u64, participants: impl IntoIterator<Item = ParticipantId>) -> Self {
        let roster = participants
            .into_iter()
            .map(|pid| (pid.clone(), Participant::new(pid)))
            .collect();

        Self {
            id,
            seed,
            roster,
            phase: SessionPhase::AwaitingAdmission,
            stage_index: 0,
            round: 1,
        }
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.roster.contains_key(participant)
    }

    pub fn connected_count(&self) -> usize {
        self.roster.values().filter(|p| p.is_connected()).count()
    }

    /// Connected participants in roster order
    pub fn connected_ids(&self) -> Vec<ParticipantId> {
        self.roster
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.roster.keys().cloned().collect()
    }

    pub fn set_status(&mut self, participant: &ParticipantId, status: ConnectionStatus) -> bool {
        match self.roster.get_mut(participant) {
            Some(p) if p.status != status => {
                p.status = status;
                true
            }
            _ => false,
        }
    }

    /// Drop every disconnected participant; only valid on fatal teardown
    pub fn remove_disconnected(&mut self) -> Vec<ParticipantId> {
        let gone: Vec<ParticipantId> = self
            .roster
            .values()
            .filter(|p| !p.is_connected())
            .map(|p| p.id.clone())
            .collect();
        for pid in &gone {
            self.roster.remove(pid);
        }
        gone
    }

    pub fn clear_roles(&mut self) {
        for p in self.roster.values_mut() {
            p.role = None;
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.phase, SessionPhase::Ended(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    #[test]
    fn generator_ids_are_unique_per_owner() {
        let a = SessionIdGenerator::new();
        let b = SessionIdGenerator::new();
        assert_eq!(a.next_id(), SessionId::new(0));
        assert_eq!(a.next_id(), SessionId::new(1));
        assert_eq!(b.next_id(), SessionId::new(0));
    }

    #[test]
    fn roster_only_shrinks_through_remove_disconnected() {
        let mut state = SessionState::new(SessionId::new(0), 7, [pid("a"), pid("b"), pid("c")]);
        assert_eq!(state.connected_count(), 3);

        assert!(state.set_status(&pid("b"), ConnectionStatus::Disconnected));
        assert!(!state.set_status(&pid("b"), ConnectionStatus::Disconnected));
        assert_eq!(state.roster.len(), 3);
        assert_eq!(state.connected_ids(), vec![pid("a"), pid("c")]);

        assert_eq!(state.remove_disconnected(), vec![pid("b")]);
        assert_eq!(state.participant_ids(), vec![pid("a"), pid("c")]);
    }

    #[test]
    fn unknown_participant_status_is_untouched() {
        let mut state = SessionState::new(SessionId::new(0), 7, [pid("a")]);
        assert!(!state.set_status(&pid("x"), ConnectionStatus::Disconnected));
        assert!(!state.contains(&pid("x")));
    }
}
