//! Lobby service - waiting room, group formation and event routing

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::experiment::registry::StagePlot;
use crate::experiment::sequencer::{SessionSettings, Settled};
use crate::experiment::session::EndReason;
use crate::experiment::{
    Ecu, ParticipantId, Session, SessionError, SessionHandle, SessionId, SessionIdGenerator,
    SessionRegistry, SessionReport,
};
use crate::store::{Checkout, CodeStore};
use crate::ws::hub::Transport;
use crate::ws::protocol::{ClientMsg, ServerMsg};

use super::queue::WaitingRoom;

/// Where a connecting participant ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Queued for a group at this position
    Waiting { position: usize },
    /// Seated in a freshly formed session
    Seated(SessionId),
    /// Returned to the session they already belong to
    Rejoined(SessionId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("Participant {0} is not on the code list")]
    Unauthorized(ParticipantId),

    #[error("Session for participant {0} is over")]
    SessionOver(ParticipantId),

    #[error("Participant {0} has not been seated in a session")]
    NotSeated(ParticipantId),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Everything a new session needs besides its members
pub struct LobbyConfig {
    pub group_size: usize,
    pub plot: StagePlot,
    pub settings: SessionSettings,
}

/// Owns the waiting room and the participant -> session map
pub struct LobbyService {
    room: Mutex<WaitingRoom>,
    sessions: Arc<SessionRegistry>,
    /// Map of participant -> current session
    participant_sessions: Arc<DashMap<ParticipantId, SessionId>>,
    /// Participants whose session has ended; filled before the
    /// participant -> session entry is dropped
    finished: Arc<DashMap<ParticipantId, Arc<Settled>>>,
    ids: SessionIdGenerator,
    plot: StagePlot,
    settings: SessionSettings,
    codes: Arc<CodeStore>,
    transport: Arc<dyn Transport>,
    checkout: Arc<dyn Checkout>,
}

impl LobbyService {
    pub fn new(
        config: LobbyConfig,
        sessions: Arc<SessionRegistry>,
        codes: Arc<CodeStore>,
        transport: Arc<dyn Transport>,
        checkout: Arc<dyn Checkout>,
    ) -> Self {
        Self {
            room: Mutex::new(WaitingRoom::new(config.group_size)),
            sessions,
            participant_sessions: Arc::new(DashMap::new()),
            finished: Arc::new(DashMap::new()),
            ids: SessionIdGenerator::new(),
            plot: config.plot,
            settings: config.settings,
            codes,
            transport,
            checkout,
        }
    }

    /// Called when a participant's socket opens
    pub async fn connect(&self, participant: ParticipantId) -> Result<Placement, LobbyError> {
        if !self.codes.is_authorized(&participant) {
            warn!(participant = %participant, "Connect from participant without codes");
            self.transport
                .redirect(&participant, &self.settings.unauthorized_url);
            return Err(LobbyError::Unauthorized(participant));
        }

        // Group formation writes the session map under this lock
        let mut room = self.room.lock().await;

        if let Some(handle) = self.session_of(&participant) {
            drop(room);
            return match handle.connect(participant.clone()).await {
                Ok(()) => Ok(Placement::Rejoined(handle.id)),
                Err(SessionError::Closed) => {
                    // Torn down but not yet cleaned up
                    let reason = handle
                        .settled()
                        .map_or(EndReason::Completed, |settled| settled.reason);
                    Err(self.reject_finished(participant, reason))
                }
                Err(e) => Err(e.into()),
            };
        }

        if let Some(settled) = self.finished_outcome(&participant) {
            drop(room);
            return Err(self.reject_finished(participant, settled.reason));
        }

        let position = room.enqueue(participant.clone());
        info!(participant = %participant, waiting = room.len(), "Participant entered waiting room");
        self.announce_waiting(&room);

        let mut seated = None;
        while let Some(group) = room.try_form_group() {
            let longest_wait = group.iter().map(|w| w.wait_time()).max().unwrap_or_default();
            info!(longest_wait_ms = longest_wait.as_millis() as u64, "Group formed");
            let members: Vec<ParticipantId> = group.into_iter().map(|w| w.participant).collect();
            let id = self.create_session(members.clone());
            if members.contains(&participant) {
                seated = Some(id);
            }
        }
        if seated.is_some() {
            self.announce_waiting(&room);
        }

        Ok(match seated {
            Some(id) => Placement::Seated(id),
            None => Placement::Waiting { position },
        })
    }

    /// Called when a participant's socket closes
    pub async fn disconnect(&self, participant: &ParticipantId) {
        let mut room = self.room.lock().await;

        if let Some(handle) = self.session_of(participant) {
            drop(room);
            if let Err(e) = handle.disconnect(participant.clone()).await {
                debug!(participant = %participant, error = %e, "Disconnect after session end");
            }
            return;
        }

        if room.dequeue(participant).is_some() {
            info!(participant = %participant, waiting = room.len(), "Participant left waiting room");
            self.announce_waiting(&room);
        }
    }

    /// Route a client message to the participant's session
    pub async fn route(&self, participant: &ParticipantId, msg: ClientMsg) {
        if let ClientMsg::Ping { t } = msg {
            self.transport.send_to(participant, ServerMsg::Pong { t });
            return;
        }

        let Some(event) = msg.into_event() else {
            return;
        };
        let Some(handle) = self.session_of(participant) else {
            debug!(participant = %participant, ?event, "Event outside a session ignored");
            return;
        };

        if let Err(e) = handle.participant_event(participant.clone(), event).await {
            debug!(participant = %participant, error = %e, "Session closed before event");
        }
    }

    pub fn session_of(&self, participant: &ParticipantId) -> Option<SessionHandle> {
        let id = *self.participant_sessions.get(participant)?;
        self.sessions.get(&id)
    }

    /// Final win of a participant, from the live session or its frozen ledger
    pub async fn settle(&self, participant: &ParticipantId) -> Result<Ecu, LobbyError> {
        if let Some(handle) = self.session_of(participant) {
            return Ok(handle.settle(participant.clone()).await?);
        }
        match self.finished_outcome(participant) {
            Some(settled) => Ok(settled
                .ledger
                .settle(participant)
                .map_err(SessionError::from)?),
            None => Err(LobbyError::NotSeated(participant.clone())),
        }
    }

    fn finished_outcome(&self, participant: &ParticipantId) -> Option<Arc<Settled>> {
        self.finished.get(participant).map(|settled| settled.clone())
    }

    pub async fn waiting_count(&self) -> usize {
        self.room.lock().await.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_sessions()
    }

    fn reject_finished(&self, participant: ParticipantId, reason: EndReason) -> LobbyError {
        match reason {
            EndReason::FatalDisconnection => self
                .transport
                .redirect(&participant, &self.settings.terminated_url),
            EndReason::Completed => self.transport.send_to(
                &participant,
                ServerMsg::Error {
                    code: "session_over".to_string(),
                    message: "Your session has already ended".to_string(),
                },
            ),
        }
        LobbyError::SessionOver(participant)
    }

    fn announce_waiting(&self, room: &WaitingRoom) {
        self.transport.broadcast(
            &room.participants(),
            ServerMsg::Waiting {
                connected: room.len(),
                required: room.group_size(),
            },
        );
    }

    /// Create and spawn a session for the given members
    fn create_session(&self, members: Vec<ParticipantId>) -> SessionId {
        let id = self.ids.next_id();
        let seed = rand::random::<u64>();

        let (session, handle) = Session::new(
            id,
            seed,
            members.clone(),
            self.plot.clone(),
            self.settings.clone(),
            self.transport.clone(),
            self.checkout.clone(),
        );

        let slot = handle.clone();
        self.sessions.insert(handle);
        for member in &members {
            self.participant_sessions.insert(member.clone(), id);
        }

        info!(session_id = %id, participants = members.len(), seed, "Created new session");

        let sessions = self.sessions.clone();
        let participant_sessions = self.participant_sessions.clone();
        let finished = self.finished.clone();

        tokio::spawn(async move {
            let report = session.run().await;
            log_report(&report);

            let settled = slot.settled().unwrap_or_else(|| {
                Arc::new(Settled {
                    reason: report.reason,
                    ledger: report.ledger.clone(),
                })
            });

            // Cleanup after session ends
            for member in members {
                finished.insert(member.clone(), settled.clone());
                participant_sessions.remove(&member);
            }
            sessions.remove(&id);

            info!(session_id = %id, "Session removed from registry");
        });

        id
    }
}

fn log_report(report: &SessionReport) {
    info!(
        session_id = %report.id,
        reason = ?report.reason,
        survivors = report.roster.len(),
        stages_entered = report.history.len(),
        "Session report"
    );
    for settlement in &report.settlements {
        debug!(
            session_id = %report.id,
            participant = %settlement.participant,
            win = settlement.win,
            "Settled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_test::assert_ok;

    use crate::experiment::registry::{StageRegistry, ULTIMATUM_GROUP};
    use crate::experiment::stage::PIE;
    use crate::store::checkout::RecordingCheckout;
    use crate::store::codes::CodeRecord;
    use crate::ws::hub::RecordingTransport;

    struct Fixture {
        lobby: Arc<LobbyService>,
        transport: Arc<RecordingTransport>,
        checkout: Arc<RecordingCheckout>,
    }

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn fixture(group_size: usize) -> Fixture {
        let codes = ["A", "B", "C", "D"]
            .iter()
            .map(|id| CodeRecord {
                id: pid(id),
                access_code: format!("acc-{id}"),
                exit_code: format!("exit-{id}"),
            })
            .collect();
        let registry = StageRegistry::ultimatum(1, 2).unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let checkout = Arc::new(RecordingCheckout::default());
        let lobby = Arc::new(LobbyService::new(
            LobbyConfig {
                group_size,
                plot: registry.sequence_for(ULTIMATUM_GROUP).unwrap(),
                settings: SessionSettings {
                    countdown: Duration::from_secs(30),
                    ..SessionSettings::default()
                },
            },
            Arc::new(SessionRegistry::new()),
            Arc::new(CodeStore::from_records(codes).unwrap()),
            transport.clone(),
            checkout.clone(),
        ));
        Fixture {
            lobby,
            transport,
            checkout,
        }
    }

    impl Fixture {
        async fn done(&self, ids: &[&str]) {
            for id in ids {
                self.lobby.route(&pid(id), ClientMsg::Done).await;
            }
        }

        async fn wait_for_teardown(&self) {
            for _ in 0..100 {
                if self.lobby.active_sessions() == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("session did not end");
        }
    }

    #[tokio::test]
    async fn unknown_code_is_redirected() {
        let f = fixture(2);
        let err = f.lobby.connect(pid("Z")).await.unwrap_err();
        assert_eq!(err, LobbyError::Unauthorized(pid("Z")));
        assert_eq!(
            f.transport.sent_to(&pid("Z")),
            vec![ServerMsg::Redirect {
                url: SessionSettings::default().unauthorized_url
            }]
        );
        assert_eq!(f.lobby.waiting_count().await, 0);
    }

    #[tokio::test]
    async fn leaving_the_waiting_room_dequeues() {
        let f = fixture(2);
        assert_eq!(
            f.lobby.connect(pid("A")).await,
            Ok(Placement::Waiting { position: 0 })
        );
        assert!(f.transport.sent_to(&pid("A")).contains(&ServerMsg::Waiting {
            connected: 1,
            required: 2,
        }));

        f.lobby.disconnect(&pid("A")).await;
        assert_eq!(f.lobby.waiting_count().await, 0);
        assert_eq!(f.lobby.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_group_plays_through_and_checks_out() {
        let f = fixture(2);
        f.lobby.connect(pid("A")).await.unwrap();
        let placement = f.lobby.connect(pid("B")).await.unwrap();
        assert!(matches!(placement, Placement::Seated(_)));
        assert_eq!(f.lobby.waiting_count().await, 0);

        // instructions, quiz
        f.done(&["A", "B"]).await;
        f.done(&["A", "B"]).await;

        let handle = f.lobby.session_of(&pid("A")).unwrap();
        let assignment = handle.round_assignment().await.unwrap();
        let (bidder, respondent) = assignment
            .pairs()
            .next()
            .map(|(b, r)| (b.clone(), r.clone()))
            .unwrap();
        f.lobby.route(&bidder, ClientMsg::Offer { value: 30 }).await;
        f.lobby
            .route(&respondent, ClientMsg::Response { accept: true })
            .await;

        // ultimatum, questionnaire
        f.done(&["A", "B"]).await;
        f.done(&["A", "B"]).await;
        f.wait_for_teardown().await;

        let mut calls = f.checkout.calls();
        calls.sort();
        let mut expected = vec![(bidder.clone(), PIE - 30), (respondent.clone(), 30)];
        expected.sort();
        assert_eq!(calls, expected);

        assert_eq!(f.lobby.settle(&bidder).await, Ok(PIE - 30));
        assert_eq!(f.lobby.settle(&respondent).await, Ok(30));

        assert_eq!(
            f.lobby.connect(pid("A")).await,
            Err(LobbyError::SessionOver(pid("A")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_returns_to_same_session() {
        let f = fixture(2);
        f.lobby.connect(pid("A")).await.unwrap();
        let Placement::Seated(id) = f.lobby.connect(pid("B")).await.unwrap() else {
            panic!("group should have formed");
        };

        f.lobby.disconnect(&pid("B")).await;
        assert_eq!(f.lobby.connect(pid("B")).await, Ok(Placement::Rejoined(id)));

        let snapshot = f.lobby.session_of(&pid("B")).unwrap().snapshot().await.unwrap();
        assert_eq!(snapshot.connected, 2);
        assert!(!snapshot.countdown_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn fatally_removed_participant_is_sent_away() {
        let f = fixture(2);
        f.lobby.connect(pid("A")).await.unwrap();
        f.lobby.connect(pid("B")).await.unwrap();

        f.lobby.disconnect(&pid("B")).await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        f.wait_for_teardown().await;

        assert_eq!(
            f.lobby.connect(pid("B")).await,
            Err(LobbyError::SessionOver(pid("B")))
        );
        let terminated = SessionSettings::default().terminated_url;
        assert!(f
            .transport
            .sent_to(&pid("B"))
            .contains(&ServerMsg::Redirect { url: terminated }));
    }

    #[tokio::test]
    async fn ping_is_answered_without_a_session() {
        let f = fixture(2);
        f.lobby.route(&pid("C"), ClientMsg::Ping { t: 42 }).await;
        assert_eq!(f.transport.sent_to(&pid("C")), vec![ServerMsg::Pong { t: 42 }]);
    }

    #[tokio::test]
    async fn settle_needs_a_seat() {
        let f = fixture(2);
        f.lobby.connect(pid("A")).await.unwrap();
        assert_eq!(
            f.lobby.settle(&pid("A")).await,
            Err(LobbyError::NotSeated(pid("A")))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_during_group_formation_is_not_lost() {
        for _ in 0..50 {
            let f = fixture(2);
            assert_ok!(f.lobby.connect(pid("A")).await);

            let joining = {
                let lobby = f.lobby.clone();
                tokio::spawn(async move { lobby.connect(pid("B")).await })
            };
            let leaving = {
                let lobby = f.lobby.clone();
                tokio::spawn(async move { lobby.disconnect(&pid("A")).await })
            };
            let placement = joining.await.unwrap().unwrap();
            leaving.await.unwrap();

            match placement {
                Placement::Waiting { position } => {
                    assert_eq!(position, 0);
                    assert_eq!(f.lobby.waiting_count().await, 1);
                    assert!(f.lobby.session_of(&pid("A")).is_none());
                }
                Placement::Seated(id) => {
                    let handle = f.lobby.session_of(&pid("A")).unwrap();
                    assert_eq!(handle.id, id);
                    let snapshot = handle.snapshot().await.unwrap();
                    assert_eq!(snapshot.connected, 1);
                    assert!(snapshot.countdown_armed);
                }
                Placement::Rejoined(_) => panic!("B was never seated"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ended_session_awaiting_cleanup_redirects_on_fatal_end() {
        let f = fixture(2);
        let lobby = &f.lobby;
        let members = vec![pid("A"), pid("B")];
        let (session, handle) = Session::new(
            lobby.ids.next_id(),
            7,
            members.clone(),
            lobby.plot.clone(),
            lobby.settings.clone(),
            lobby.transport.clone(),
            lobby.checkout.clone(),
        );
        // Registered without the cleanup task so the entry outlives the loop
        lobby.sessions.insert(handle.clone());
        for member in &members {
            lobby.participant_sessions.insert(member.clone(), handle.id);
        }
        let running = tokio::spawn(session.run());

        assert_ok!(handle.disconnect(pid("B")).await);
        tokio::time::sleep(Duration::from_secs(31)).await;
        let report = running.await.unwrap();
        assert_eq!(report.reason, EndReason::FatalDisconnection);
        assert!(lobby.session_of(&pid("B")).is_some());

        assert_eq!(
            lobby.connect(pid("B")).await,
            Err(LobbyError::SessionOver(pid("B")))
        );
        let terminated = SessionSettings::default().terminated_url;
        assert!(f
            .transport
            .sent_to(&pid("B"))
            .contains(&ServerMsg::Redirect { url: terminated }));
        assert!(!f.transport.sent_to(&pid("B")).contains(&ServerMsg::Error {
            code: "session_over".to_string(),
            message: "Your session has already ended".to_string(),
        }));
    }
}
