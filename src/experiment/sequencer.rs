//! Stage sequencer: the per-session event loop

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::store::Checkout;
use crate::ws::hub::Transport;
use crate::ws::protocol::ServerMsg;

use super::error::{ConnectError, LedgerError, SessionError};
use super::ledger::{OutcomeLedger, Settlement};
use super::lifecycle::{ConnectOutcome, DisconnectOutcome, LifecycleManager};
use super::matching::RoundAssignment;
use super::registry::StagePlot;
use super::session::{EndReason, SessionId, SessionPhase, SessionState, ENDED_STAGE};
use super::stage::{apply_credit, ParticipantEvent, Stage, StageBehavior, StageContext, StageSignal};
use super::{Ecu, ParticipantId};

/// Event queue depth per session
const EVENT_BUFFER: usize = 256;

/// Events consumed by a session's loop, processed strictly in arrival order
#[derive(Debug)]
pub enum SessionEvent {
    Connect {
        participant: ParticipantId,
        reply: Option<oneshot::Sender<Result<(), ConnectError>>>,
    },
    Disconnect {
        participant: ParticipantId,
    },
    Participant {
        from: ParticipantId,
        event: ParticipantEvent,
    },
    /// Handler-level signal that the current stage may advance
    StageComplete,
    CountdownExpired {
        epoch: u64,
    },
    Credit {
        participant: ParticipantId,
        round: u32,
        amount: Ecu,
        reply: oneshot::Sender<Result<Ecu, LedgerError>>,
    },
    Settle {
        participant: ParticipantId,
        reply: oneshot::Sender<Result<Ecu, LedgerError>>,
    },
    GetAssignment {
        reply: oneshot::Sender<Option<RoundAssignment>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub countdown: Duration,
    /// Where survivors are sent on fatal disconnection
    pub terminated_url: String,
    /// Where unauthorized connects are sent
    pub unauthorized_url: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(30),
            terminated_url: "/ultimatum/gameterminated.html".to_string(),
            unauthorized_url: "/ultimatum/unauth.htm".to_string(),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub stage: String,
    pub round: u32,
    pub awaiting_admission: bool,
    pub connected: usize,
    pub roster: usize,
    pub countdown_armed: bool,
}

/// A stage entry performed by the sequencer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEntry {
    pub stage: String,
    pub round: u32,
    /// Connected participants at the moment of entry
    pub connected: usize,
}

/// What remains of a session after teardown
#[derive(Debug)]
pub struct SessionReport {
    pub id: SessionId,
    pub reason: EndReason,
    /// Roster after teardown (fatally removed participants excluded)
    pub roster: Vec<ParticipantId>,
    pub settlements: Vec<Settlement>,
    /// Closed ledger; `settle` is callable on it
    pub ledger: OutcomeLedger,
    pub history: Vec<StageEntry>,
}

/// Frozen outcome of a torn-down session, readable after its loop exits
#[derive(Debug)]
pub struct Settled {
    pub reason: EndReason,
    pub ledger: OutcomeLedger,
}

/// Written once at teardown, before the event receiver is dropped
type SettledSlot = Arc<OnceLock<Arc<Settled>>>;

/// Handle for feeding events into a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    participants: Arc<[ParticipantId]>,
    event_tx: mpsc::Sender<SessionEvent>,
    settled: SettledSlot,
}

impl SessionHandle {
    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    async fn send(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionEvent,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn connect(&self, participant: ParticipantId) -> Result<(), SessionError> {
        self.request(|reply| SessionEvent::Connect {
            participant,
            reply: Some(reply),
        })
        .await?
        .map_err(SessionError::from)
    }

    pub async fn disconnect(&self, participant: ParticipantId) -> Result<(), SessionError> {
        self.send(SessionEvent::Disconnect { participant }).await
    }

    pub async fn participant_event(
        &self,
        from: ParticipantId,
        event: ParticipantEvent,
    ) -> Result<(), SessionError> {
        self.send(SessionEvent::Participant { from, event }).await
    }

    pub async fn report_stage_complete(&self) -> Result<(), SessionError> {
        self.send(SessionEvent::StageComplete).await
    }

    pub async fn round_assignment(&self) -> Result<RoundAssignment, SessionError> {
        self.request(|reply| SessionEvent::GetAssignment { reply })
            .await?
            .ok_or(SessionError::NoActiveRound)
    }

    pub async fn credit(
        &self,
        participant: ParticipantId,
        round: u32,
        amount: Ecu,
    ) -> Result<Ecu, SessionError> {
        self.request(|reply| SessionEvent::Credit {
            participant,
            round,
            amount,
            reply,
        })
        .await?
        .map_err(SessionError::from)
    }

    /// Fails with `SessionNotEnded` while the session runs; after teardown
    /// reads the frozen ledger
    pub async fn settle(&self, participant: ParticipantId) -> Result<Ecu, SessionError> {
        if let Some(settled) = self.settled() {
            return Ok(settled.ledger.settle(&participant)?);
        }

        match self
            .request(|reply| SessionEvent::Settle {
                participant: participant.clone(),
                reply,
            })
            .await
        {
            Ok(result) => result.map_err(SessionError::from),
            Err(SessionError::Closed) => match self.settled() {
                Some(settled) => Ok(settled.ledger.settle(&participant)?),
                None => Err(SessionError::Closed),
            },
            Err(e) => Err(e),
        }
    }

    /// Outcome of the session once it has been torn down
    pub fn settled(&self) -> Option<Arc<Settled>> {
        self.settled.get().cloned()
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionEvent::Snapshot { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// The authoritative session. Owns all state for one group.
pub struct Session {
    state: SessionState,
    plot: StagePlot,
    stage: Option<Stage>,
    assignment: Option<RoundAssignment>,
    /// Participants that reported `Done` for the current stage entry
    done: BTreeSet<ParticipantId>,
    lifecycle: LifecycleManager,
    ledger: OutcomeLedger,
    settings: SessionSettings,
    transport: Arc<dyn Transport>,
    checkout: Arc<dyn Checkout>,
    event_rx: mpsc::Receiver<SessionEvent>,
    history: Vec<StageEntry>,
    settlements: Vec<Settlement>,
    settled: SettledSlot,
}

impl Session {
    pub fn new(
        id: SessionId,
        seed: u64,
        participants: Vec<ParticipantId>,
        plot: StagePlot,
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
        checkout: Arc<dyn Checkout>,
    ) -> (Self, SessionHandle) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let settled = SettledSlot::default();

        let handle = SessionHandle {
            id,
            participants: participants.clone().into(),
            event_tx: event_tx.clone(),
            settled: settled.clone(),
        };

        let session = Self {
            state: SessionState::new(id, seed, participants),
            plot,
            stage: None,
            assignment: None,
            done: BTreeSet::new(),
            lifecycle: LifecycleManager::new(settings.countdown, event_tx),
            ledger: OutcomeLedger::new(),
            settings,
            transport,
            checkout,
            event_rx,
            history: Vec::new(),
            settlements: Vec::new(),
            settled,
        };

        (session, handle)
    }

    /// Run until the plot completes or a disconnection turns fatal
    pub async fn run(mut self) -> SessionReport {
        info!(
            session_id = %self.state.id,
            participants = self.state.roster.len(),
            stages = self.plot.len(),
            "Session started"
        );

        self.advance();

        while !self.state.is_ended() {
            let Some(event) = self.event_rx.recv().await else {
                break;
            };
            self.handle_event(event);
        }

        self.into_report()
    }

    fn current_stage_id(&self) -> &str {
        match self.state.phase {
            SessionPhase::Ended(_) => ENDED_STAGE,
            _ => self
                .plot
                .get(self.state.stage_index)
                .map(|s| s.id.as_str())
                .unwrap_or(ENDED_STAGE),
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connect { participant, reply } => {
                let result = self.handle_connect(&participant);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SessionEvent::Disconnect { participant } => self.handle_disconnect(&participant),
            SessionEvent::Participant { from, event } => self.handle_participant(&from, event),
            SessionEvent::StageComplete => {
                if self.state.phase == SessionPhase::InStage {
                    self.complete_stage();
                } else {
                    debug!(session_id = %self.state.id, "Stage complete outside of a stage ignored");
                }
            }
            SessionEvent::CountdownExpired { epoch } => {
                if self.lifecycle.on_expired(epoch) {
                    warn!(session_id = %self.state.id, "Countdown fired, session terminated");
                    self.end(EndReason::FatalDisconnection);
                }
            }
            SessionEvent::Credit {
                participant,
                round,
                amount,
                reply,
            } => {
                let result = self.credit(&participant, round, amount);
                let _ = reply.send(result);
            }
            SessionEvent::Settle { participant, reply } => {
                let _ = reply.send(self.ledger.settle(&participant));
            }
            SessionEvent::GetAssignment { reply } => {
                let _ = reply.send(self.assignment.clone());
            }
            SessionEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.state.id,
            stage: self.current_stage_id().to_string(),
            round: self.state.round,
            awaiting_admission: self.state.phase == SessionPhase::AwaitingAdmission,
            connected: self.state.connected_count(),
            roster: self.state.roster.len(),
            countdown_armed: self.lifecycle.is_armed(),
        }
    }

    fn credit(&mut self, participant: &ParticipantId, round: u32, amount: Ecu) -> Result<Ecu, LedgerError> {
        let result = apply_credit(&mut self.state, &mut self.ledger, participant, round, amount);
        match &result {
            Ok(total) => debug!(
                session_id = %self.state.id,
                participant = %participant,
                round,
                amount,
                total,
                "Credit applied"
            ),
            Err(e) => warn!(session_id = %self.state.id, error = %e, "Credit rejected"),
        }
        result
    }

    fn handle_connect(&mut self, participant: &ParticipantId) -> Result<(), ConnectError> {
        let outcome = match self.lifecycle.on_connect(&mut self.state, participant) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.transport
                    .redirect(participant, &self.settings.unauthorized_url);
                return Err(e);
            }
        };

        if let ConnectOutcome::Reconnected { .. } = outcome {
            let others: Vec<ParticipantId> = self
                .state
                .connected_ids()
                .into_iter()
                .filter(|p| p != participant)
                .collect();
            self.transport.broadcast(
                &others,
                ServerMsg::ParticipantConnected {
                    participant: participant.clone(),
                },
            );

            match self.state.phase {
                SessionPhase::AwaitingAdmission => self.advance(),
                SessionPhase::InStage => self.resync(participant),
                SessionPhase::Ended(_) => {}
            }
        }

        Ok(())
    }

    /// Bring a returning participant up to date with the current stage
    fn resync(&self, participant: &ParticipantId) {
        self.transport.send_to(
            participant,
            ServerMsg::StageStarted {
                stage: self.current_stage_id().to_string(),
                round: self.state.round,
            },
        );
        if let Some(seat) = self.assignment.as_ref().and_then(|a| a.seat(participant)) {
            self.transport.send_to(
                participant,
                ServerMsg::RoleAssigned {
                    round: self.state.round,
                    role: seat.role,
                    other: seat.counterpart.clone(),
                },
            );
        }
    }

    fn handle_disconnect(&mut self, participant: &ParticipantId) {
        let outcome = self.lifecycle.on_disconnect(&mut self.state, participant);
        if outcome == DisconnectOutcome::Ignored {
            return;
        }

        self.transport.broadcast(
            &self.state.connected_ids(),
            ServerMsg::ParticipantDisconnected {
                participant: participant.clone(),
            },
        );
        if outcome == DisconnectOutcome::CountdownArmed {
            self.announce_countdown();
        }

        // Synchronized stepping only waits for connected participants
        if self.state.phase == SessionPhase::InStage && self.all_done() {
            self.complete_stage();
        }
    }

    fn announce_countdown(&self) {
        self.transport.broadcast(
            &self.state.connected_ids(),
            ServerMsg::Countdown {
                seconds_remaining: self.lifecycle.countdown_duration().as_secs(),
            },
        );
    }

    fn handle_participant(&mut self, from: &ParticipantId, event: ParticipantEvent) {
        if !self.state.contains(from) {
            warn!(session_id = %self.state.id, participant = %from, "Event from non-member ignored");
            return;
        }
        if self.state.phase != SessionPhase::InStage {
            debug!(session_id = %self.state.id, participant = %from, "Event outside of a stage ignored");
            return;
        }

        if event == ParticipantEvent::Done {
            self.done.insert(from.clone());
        }

        let signal = self.with_stage(|stage, ctx| stage.on_participant_event(ctx, from, &event));
        match signal {
            Some(Ok(StageSignal::Complete)) => self.complete_stage(),
            Some(Ok(StageSignal::Pending)) | None => {
                if self.all_done() {
                    self.complete_stage();
                }
            }
            Some(Err(e)) => {
                warn!(
                    session_id = %self.state.id,
                    stage = self.current_stage_id(),
                    participant = %from,
                    error = %e,
                    "Stage handler error"
                );
                self.transport.send_to(
                    from,
                    ServerMsg::Error {
                        code: "stage_error".to_string(),
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    fn all_done(&self) -> bool {
        let connected = self.state.connected_ids();
        !connected.is_empty() && connected.iter().all(|p| self.done.contains(p))
    }

    /// Run `f` against the active stage with a context over session state
    fn with_stage<R>(
        &mut self,
        f: impl FnOnce(&mut Stage, &mut StageContext<'_>) -> R,
    ) -> Option<R> {
        let stage = self.stage.as_mut()?;
        let stage_id = self.plot.get(self.state.stage_index)?.id.as_str();
        let mut ctx = StageContext {
            stage_id,
            state: &mut self.state,
            ledger: &mut self.ledger,
            assignment: &mut self.assignment,
            transport: self.transport.as_ref(),
        };
        Some(f(stage, &mut ctx))
    }

    /// Enter stages until one suspends, admission blocks, or the plot ends
    fn advance(&mut self) {
        while !self.state.is_ended() {
            match self.try_enter() {
                Some(StageSignal::Complete) => self.finish_stage(),
                Some(StageSignal::Pending) | None => return,
            }
        }
    }

    /// Attempt to enter the stage under the cursor. `None` when blocked.
    fn try_enter(&mut self) -> Option<StageSignal> {
        let Some(descriptor) = self.plot.get(self.state.stage_index).cloned() else {
            self.end(EndReason::Completed);
            return None;
        };

        let connected = self.state.connected_count();
        if let Some(rule) = descriptor.admission {
            if !rule.is_satisfied(connected) {
                self.state.phase = SessionPhase::AwaitingAdmission;
                warn!(
                    session_id = %self.state.id,
                    stage = %descriptor.id,
                    connected,
                    required = rule.min_players,
                    "Not enough participants to enter stage"
                );
                self.transport.broadcast(
                    &self.state.connected_ids(),
                    ServerMsg::Waiting {
                        connected,
                        required: rule.min_players,
                    },
                );
                if self.lifecycle.arm() {
                    self.announce_countdown();
                }
                return None;
            }
        }

        self.state.phase = SessionPhase::InStage;
        self.done.clear();
        self.history.push(StageEntry {
            stage: descriptor.id.clone(),
            round: self.state.round,
            connected,
        });
        info!(
            session_id = %self.state.id,
            stage = %descriptor.id,
            round = self.state.round,
            "Entering stage"
        );
        self.transport.broadcast(
            &self.state.connected_ids(),
            ServerMsg::StageStarted {
                stage: descriptor.id.clone(),
                round: self.state.round,
            },
        );

        self.stage = Some(descriptor.kind.behavior());
        match self.with_stage(|stage, ctx| stage.on_enter(ctx)) {
            Some(Ok(signal)) => Some(signal),
            Some(Err(e)) => {
                error!(session_id = %self.state.id, stage = %descriptor.id, error = %e, "Stage enter failed");
                Some(StageSignal::Pending)
            }
            None => Some(StageSignal::Pending),
        }
    }

    fn complete_stage(&mut self) {
        self.finish_stage();
        self.advance();
    }

    /// Close out the active stage and move the cursor forward
    fn finish_stage(&mut self) {
        if let Some(Err(e)) = self.with_stage(|stage, ctx| stage.on_complete(ctx)) {
            error!(session_id = %self.state.id, error = %e, "Stage completion failed");
        }
        self.stage = None;
        self.assignment = None;
        self.done.clear();

        let repeat = self
            .plot
            .get(self.state.stage_index)
            .map(|s| s.repeat)
            .unwrap_or(1);
        if self.state.round < repeat {
            self.state.round += 1;
        } else {
            self.state.stage_index += 1;
            self.state.round = 1;
        }
        self.state.phase = SessionPhase::AwaitingAdmission;
    }

    /// Tear the session down and settle the ledger
    fn end(&mut self, reason: EndReason) {
        if self.state.is_ended() {
            return;
        }
        self.state.phase = SessionPhase::Ended(reason);
        self.lifecycle.clear();
        self.stage = None;
        self.assignment = None;

        if reason == EndReason::FatalDisconnection {
            let removed = self.state.remove_disconnected();
            info!(session_id = %self.state.id, removed = ?removed, "Fatally removed participants");
            for participant in self.state.participant_ids() {
                self.transport
                    .redirect(&participant, &self.settings.terminated_url);
            }
        }

        self.ledger.close();
        let survivors = self.state.participant_ids();
        match self.ledger.checkout_all(&survivors, self.checkout.as_ref()) {
            Ok(settlements) => {
                info!(session_id = %self.state.id, reason = ?reason, "FINAL PAYOFF PER PLAYER");
                for s in &settlements {
                    info!(session_id = %self.state.id, participant = %s.participant, win = s.win, "Final payoff");
                }
                self.settlements = settlements;
            }
            Err(e) => error!(session_id = %self.state.id, error = %e, "Settlement failed"),
        }
        let _ = self.settled.set(Arc::new(Settled {
            reason,
            ledger: self.ledger.clone(),
        }));
        info!(session_id = %self.state.id, reason = ?reason, "Session ended");
    }

    fn into_report(mut self) -> SessionReport {
        if !self.state.is_ended() {
            self.end(EndReason::FatalDisconnection);
        }
        let reason = match self.state.phase {
            SessionPhase::Ended(reason) => reason,
            _ => EndReason::FatalDisconnection,
        };

        SessionReport {
            id: self.state.id,
            reason,
            roster: self.state.participant_ids(),
            settlements: std::mem::take(&mut self.settlements),
            ledger: std::mem::take(&mut self.ledger),
            history: std::mem::take(&mut self.history),
        }
    }
}

/// Registry of running sessions
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, h)| h)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_participants(&self) -> usize {
        self.sessions
            .iter()
            .map(|s| s.value().participants().len())
            .sum()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
