//! Participant lifecycle: connect, disconnect and the fatal countdown

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::ConnectError;
use super::sequencer::SessionEvent;
use super::session::{ConnectionStatus, SessionState};
use super::ParticipantId;

/// Result of a connect event for a roster member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Reconnected {
        /// Whether the pending countdown was cancelled
        countdown_cleared: bool,
    },
    AlreadyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// A new countdown was started
    CountdownArmed,
    /// A countdown was already pending
    Coalesced,
    /// Unknown or already disconnected participant
    Ignored,
}

struct Countdown {
    epoch: u64,
    handle: JoinHandle<()>,
}

/// Tracks disconnected participants and the session's single countdown.
///
/// At most one countdown is in flight per session. Expiry is delivered as a
/// [`SessionEvent::CountdownExpired`] tagged with the epoch it was armed
/// under; expiries from a cancelled epoch are ignored.
pub struct LifecycleManager {
    duration: Duration,
    epoch: u64,
    countdown: Option<Countdown>,
    disconnected: BTreeSet<ParticipantId>,
    events: mpsc::Sender<SessionEvent>,
}

impl LifecycleManager {
    pub fn new(duration: Duration, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            duration,
            epoch: 0,
            countdown: None,
            disconnected: BTreeSet::new(),
            events,
        }
    }

    pub fn countdown_duration(&self) -> Duration {
        self.duration
    }

    pub fn is_armed(&self) -> bool {
        self.countdown.is_some()
    }

    pub fn disconnected(&self) -> impl Iterator<Item = &ParticipantId> {
        self.disconnected.iter()
    }

    pub fn on_connect(
        &mut self,
        state: &mut SessionState,
        participant: &ParticipantId,
    ) -> Result<ConnectOutcome, ConnectError> {
        if !state.contains(participant) {
            warn!(session_id = %state.id, participant = %participant, "Unauthorized connect");
            return Err(ConnectError::UnauthorizedConnect(participant.clone()));
        }

        if !state.set_status(participant, ConnectionStatus::Connected) {
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        self.disconnected.remove(participant);
        let countdown_cleared = self.disconnected.is_empty() && self.clear();
        info!(
            session_id = %state.id,
            participant = %participant,
            countdown_cleared,
            "Participant reconnected"
        );
        Ok(ConnectOutcome::Reconnected { countdown_cleared })
    }

    pub fn on_disconnect(
        &mut self,
        state: &mut SessionState,
        participant: &ParticipantId,
    ) -> DisconnectOutcome {
        if !state.set_status(participant, ConnectionStatus::Disconnected) {
            return DisconnectOutcome::Ignored;
        }

        self.disconnected.insert(participant.clone());
        info!(session_id = %state.id, participant = %participant, "Participant disconnected");

        if self.arm() {
            DisconnectOutcome::CountdownArmed
        } else {
            DisconnectOutcome::Coalesced
        }
    }

    /// Start the countdown unless one is already pending
    pub fn arm(&mut self) -> bool {
        if self.countdown.is_some() {
            return false;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let duration = self.duration;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // Session may already be gone
            let _ = events.send(SessionEvent::CountdownExpired { epoch }).await;
        });

        debug!(epoch, secs = duration.as_secs(), "Countdown armed");
        self.countdown = Some(Countdown { epoch, handle });
        true
    }

    /// Cancel the pending countdown, if any
    pub fn clear(&mut self) -> bool {
        match self.countdown.take() {
            Some(countdown) => {
                countdown.handle.abort();
                debug!(epoch = countdown.epoch, "Countdown cleared");
                true
            }
            None => false,
        }
    }

    /// Whether an expiry for `epoch` is fatal (i.e. not stale)
    pub fn on_expired(&mut self, epoch: u64) -> bool {
        match &self.countdown {
            Some(countdown) if countdown.epoch == epoch => {
                self.countdown = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.clear();
    }
}
