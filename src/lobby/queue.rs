//! Waiting room: participants not yet assigned to a session

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::experiment::ParticipantId;

/// Participant waiting for a group
#[derive(Debug, Clone)]
pub struct WaitingParticipant {
    pub participant: ParticipantId,
    joined_at: Instant,
}

impl WaitingParticipant {
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            joined_at: Instant::now(),
        }
    }

    /// How long this participant has been waiting
    pub fn wait_time(&self) -> Duration {
        self.joined_at.elapsed()
    }
}

/// FIFO of connected participants, drained in groups of a fixed size
pub struct WaitingRoom {
    queue: VecDeque<WaitingParticipant>,
    group_size: usize,
}

impl WaitingRoom {
    pub fn new(group_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            group_size: group_size.max(1),
        }
    }

    /// Add a participant; a rejoin keeps the original place in line
    pub fn enqueue(&mut self, participant: ParticipantId) -> usize {
        if let Some(pos) = self.position(&participant) {
            return pos;
        }
        self.queue.push_back(WaitingParticipant::new(participant));
        self.queue.len() - 1
    }

    pub fn dequeue(&mut self, participant: &ParticipantId) -> Option<WaitingParticipant> {
        let pos = self.position(participant)?;
        self.queue.remove(pos)
    }

    pub fn position(&self, participant: &ParticipantId) -> Option<usize> {
        self.queue.iter().position(|w| &w.participant == participant)
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.position(participant).is_some()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.queue.iter().map(|w| w.participant.clone()).collect()
    }

    /// Take the longest-waiting full group, or None if not enough are waiting
    pub fn try_form_group(&mut self) -> Option<Vec<WaitingParticipant>> {
        if self.queue.len() < self.group_size {
            return None;
        }
        Some(self.queue.drain(..self.group_size).collect())
    }
}
