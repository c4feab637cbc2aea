//! Stage behaviors: the closed set of stages a plot can contain

use std::collections::HashMap;

use tracing::{debug, info};

use crate::ws::hub::Transport;
use crate::ws::protocol::ServerMsg;

use super::error::{LedgerError, StageError};
use super::ledger::OutcomeLedger;
use super::matching::{match_round, Role, RoundAssignment};
use super::session::SessionState;
use super::{Ecu, ParticipantId};

/// Size of the pie split between bidder and respondent
pub const PIE: Ecu = 100;

/// Stage variants known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Instructions,
    Quiz,
    Ultimatum,
    Questionnaire,
    Endgame,
}

impl StageKind {
    /// Fresh behavior for one entry into the stage
    pub fn behavior(&self) -> Stage {
        match self {
            StageKind::Instructions => Stage::Instructions(PassiveStage),
            StageKind::Quiz => Stage::Quiz(PassiveStage),
            StageKind::Ultimatum => Stage::Ultimatum(UltimatumRound::default()),
            StageKind::Questionnaire => Stage::Questionnaire(PassiveStage),
            StageKind::Endgame => Stage::Endgame(Endgame),
        }
    }
}

/// Participant input forwarded to the active stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantEvent {
    Done,
    Offer { value: u64 },
    Response { accept: bool },
}

/// What the handler wants the sequencer to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSignal {
    /// Wait for further events
    Pending,
    /// The stage is finished; advance
    Complete,
}

/// View of the session handed to a stage handler
pub struct StageContext<'a> {
    pub stage_id: &'a str,
    pub state: &'a mut SessionState,
    pub ledger: &'a mut OutcomeLedger,
    pub assignment: &'a mut Option<RoundAssignment>,
    pub transport: &'a dyn Transport,
}

impl StageContext<'_> {
    pub fn round(&self) -> u32 {
        self.state.round
    }

    pub fn send_to(&self, participant: &ParticipantId, msg: ServerMsg) {
        self.transport.send_to(participant, msg);
    }

    /// Credit the current round
    pub fn credit(&mut self, participant: &ParticipantId, amount: Ecu) -> Result<Ecu, LedgerError> {
        let round = self.state.round;
        apply_credit(self.state, self.ledger, participant, round, amount)
    }
}

/// Route a credit through the ledger and mirror the total onto the roster
pub fn apply_credit(
    state: &mut SessionState,
    ledger: &mut OutcomeLedger,
    participant: &ParticipantId,
    round: u32,
    amount: Ecu,
) -> Result<Ecu, LedgerError> {
    let total = ledger.credit(participant, round, amount)?;
    if let Some(p) = state.roster.get_mut(participant) {
        p.outcome = total;
    }
    Ok(total)
}

/// Behavior shared by every stage variant
pub trait StageBehavior {
    fn on_enter(&mut self, ctx: &mut StageContext<'_>) -> Result<StageSignal, StageError>;

    fn on_participant_event(
        &mut self,
        ctx: &mut StageContext<'_>,
        from: &ParticipantId,
        event: &ParticipantEvent,
    ) -> Result<StageSignal, StageError>;

    fn on_complete(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError>;
}

/// Active stage instance
#[derive(Debug)]
pub enum Stage {
    Instructions(PassiveStage),
    Quiz(PassiveStage),
    Ultimatum(UltimatumRound),
    Questionnaire(PassiveStage),
    Endgame(Endgame),
}

impl Stage {
    fn inner(&mut self) -> &mut dyn StageBehavior {
        match self {
            Stage::Instructions(s) | Stage::Quiz(s) | Stage::Questionnaire(s) => s,
            Stage::Ultimatum(s) => s,
            Stage::Endgame(s) => s,
        }
    }
}

impl StageBehavior for Stage {
    fn on_enter(&mut self, ctx: &mut StageContext<'_>) -> Result<StageSignal, StageError> {
        self.inner().on_enter(ctx)
    }

    fn on_participant_event(
        &mut self,
        ctx: &mut StageContext<'_>,
        from: &ParticipantId,
        event: &ParticipantEvent,
    ) -> Result<StageSignal, StageError> {
        self.inner().on_participant_event(ctx, from, event)
    }

    fn on_complete(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        self.inner().on_complete(ctx)
    }
}

/// Content lives entirely client side; completes on synchronized `Done`
#[derive(Debug, Default)]
pub struct PassiveStage;

impl StageBehavior for PassiveStage {
    fn on_enter(&mut self, ctx: &mut StageContext<'_>) -> Result<StageSignal, StageError> {
        info!(session_id = %ctx.state.id, stage = ctx.stage_id, "Stage entered");
        Ok(StageSignal::Pending)
    }

    fn on_participant_event(
        &mut self,
        _ctx: &mut StageContext<'_>,
        _from: &ParticipantId,
        _event: &ParticipantEvent,
    ) -> Result<StageSignal, StageError> {
        Ok(StageSignal::Pending)
    }

    fn on_complete(&mut self, _ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        Ok(())
    }
}

/// One round of the ultimatum game
#[derive(Debug, Default)]
pub struct UltimatumRound {
    /// Pending offers keyed by bidder
    offers: HashMap<ParticipantId, u64>,
}

impl UltimatumRound {
    fn seat_of(
        ctx: &StageContext<'_>,
        participant: &ParticipantId,
    ) -> Result<(Role, Option<ParticipantId>), StageError> {
        ctx.assignment
            .as_ref()
            .and_then(|a| a.seat(participant))
            .map(|seat| (seat.role, seat.counterpart.clone()))
            .ok_or_else(|| StageError::NotMatched(participant.clone()))
    }

    fn handle_offer(
        &mut self,
        ctx: &mut StageContext<'_>,
        from: &ParticipantId,
        value: u64,
    ) -> Result<StageSignal, StageError> {
        let (role, counterpart) = Self::seat_of(ctx, from)?;
        let respondent = match (role, counterpart) {
            (Role::Bidder, Some(respondent)) => respondent,
            _ => {
                return Err(StageError::WrongRole {
                    participant: from.clone(),
                    role: role.as_str(),
                    action: "offer",
                })
            }
        };
        if value > PIE {
            return Err(StageError::InvalidOffer(value));
        }
        if self.offers.contains_key(from) {
            return Err(StageError::OfferAlreadyMade(from.clone()));
        }

        self.offers.insert(from.clone(), value);
        debug!(session_id = %ctx.state.id, bidder = %from, value, "Offer made");
        ctx.send_to(
            &respondent,
            ServerMsg::OfferMade {
                from: from.clone(),
                value,
            },
        );
        Ok(StageSignal::Pending)
    }

    fn handle_response(
        &mut self,
        ctx: &mut StageContext<'_>,
        from: &ParticipantId,
        accept: bool,
    ) -> Result<StageSignal, StageError> {
        let (role, counterpart) = Self::seat_of(ctx, from)?;
        let bidder = match (role, counterpart) {
            (Role::Respondent, Some(bidder)) => bidder,
            _ => {
                return Err(StageError::WrongRole {
                    participant: from.clone(),
                    role: role.as_str(),
                    action: "respond",
                })
            }
        };
        let offer = *self
            .offers
            .get(&bidder)
            .ok_or_else(|| StageError::NoPendingOffer(bidder.clone()))?;

        let (respondent_win, bidder_win) = if accept { (offer, PIE - offer) } else { (0, 0) };

        // Both sides of the exchange apply, or neither does
        let round = ctx.round();
        for participant in [from, &bidder] {
            if ctx.ledger.has_credit(participant, round) {
                return Err(LedgerError::DuplicateCredit {
                    participant: participant.clone(),
                    round,
                }
                .into());
            }
        }
        ctx.credit(from, respondent_win)?;
        ctx.credit(&bidder, bidder_win)?;

        info!(
            session_id = %ctx.state.id,
            round = ctx.round(),
            respondent = %from,
            bidder = %bidder,
            accepted = accept,
            offer,
            "Round settled"
        );

        ctx.send_to(
            from,
            ServerMsg::RoundResult {
                round,
                accepted: accept,
                offer,
                win: respondent_win,
            },
        );
        ctx.send_to(
            &bidder,
            ServerMsg::RoundResult {
                round,
                accepted: accept,
                offer,
                win: bidder_win,
            },
        );
        Ok(StageSignal::Pending)
    }
}

impl StageBehavior for UltimatumRound {
    fn on_enter(&mut self, ctx: &mut StageContext<'_>) -> Result<StageSignal, StageError> {
        let round = ctx.round();
        let assignment = match_round(&ctx.state.connected_ids(), round, ctx.state.seed);

        for (pid, seat) in &assignment.seats {
            if let Some(p) = ctx.state.roster.get_mut(pid) {
                p.role = Some(seat.role);
            }
            ctx.send_to(
                pid,
                ServerMsg::RoleAssigned {
                    round,
                    role: seat.role,
                    other: seat.counterpart.clone(),
                },
            );
        }

        info!(
            session_id = %ctx.state.id,
            round,
            pairs = assignment.pairs().count(),
            "Matching completed"
        );
        *ctx.assignment = Some(assignment);
        Ok(StageSignal::Pending)
    }

    fn on_participant_event(
        &mut self,
        ctx: &mut StageContext<'_>,
        from: &ParticipantId,
        event: &ParticipantEvent,
    ) -> Result<StageSignal, StageError> {
        match event {
            ParticipantEvent::Offer { value } => self.handle_offer(ctx, from, *value),
            ParticipantEvent::Response { accept } => self.handle_response(ctx, from, *accept),
            ParticipantEvent::Done => Ok(StageSignal::Pending),
        }
    }

    fn on_complete(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        *ctx.assignment = None;
        ctx.state.clear_roles();
        self.offers.clear();
        Ok(())
    }
}

/// Announces each participant's accumulated win, then ends the plot
#[derive(Debug, Default)]
pub struct Endgame;

impl StageBehavior for Endgame {
    fn on_enter(&mut self, ctx: &mut StageContext<'_>) -> Result<StageSignal, StageError> {
        for pid in ctx.state.participant_ids() {
            let amount = ctx.ledger.total(&pid);
            ctx.send_to(&pid, ServerMsg::Win { amount });
        }
        info!(session_id = %ctx.state.id, "Endgame reached");
        Ok(StageSignal::Complete)
    }

    fn on_participant_event(
        &mut self,
        _ctx: &mut StageContext<'_>,
        _from: &ParticipantId,
        _event: &ParticipantEvent,
    ) -> Result<StageSignal, StageError> {
        Ok(StageSignal::Complete)
    }

    fn on_complete(&mut self, _ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::session::SessionId;
    use crate::ws::hub::RecordingTransport;

    struct Fixture {
        state: SessionState,
        ledger: OutcomeLedger,
        assignment: Option<RoundAssignment>,
        transport: RecordingTransport,
    }

    impl Fixture {
        fn new(ids: &[&str]) -> Self {
            Self {
                state: SessionState::new(
                    SessionId::new(0),
                    11,
                    ids.iter().map(|s| ParticipantId::new(*s)),
                ),
                ledger: OutcomeLedger::new(),
                assignment: None,
                transport: RecordingTransport::default(),
            }
        }

        fn ctx(&mut self) -> StageContext<'_> {
            StageContext {
                stage_id: "ultimatum",
                state: &mut self.state,
                ledger: &mut self.ledger,
                assignment: &mut self.assignment,
                transport: &self.transport,
            }
        }

        fn pair(&self) -> (ParticipantId, ParticipantId) {
            let assignment = self.assignment.as_ref().unwrap();
            let (b, r) = assignment.pairs().next().unwrap();
            (b.clone(), r.clone())
        }
    }

    #[test]
    fn accepted_offer_credits_both_sides() {
        let mut fx = Fixture::new(&["a", "b"]);
        let mut stage = UltimatumRound::default();
        stage.on_enter(&mut fx.ctx()).unwrap();
        let (bidder, respondent) = fx.pair();

        stage
            .on_participant_event(&mut fx.ctx(), &bidder, &ParticipantEvent::Offer { value: 40 })
            .unwrap();
        assert!(fx
            .transport
            .sent_to(&respondent)
            .contains(&ServerMsg::OfferMade {
                from: bidder.clone(),
                value: 40
            }));

        stage
            .on_participant_event(
                &mut fx.ctx(),
                &respondent,
                &ParticipantEvent::Response { accept: true },
            )
            .unwrap();

        assert_eq!(fx.ledger.total(&respondent), 40);
        assert_eq!(fx.ledger.total(&bidder), 60);
        assert_eq!(fx.state.roster[&bidder].outcome, 60);
    }

    #[test]
    fn rejected_offer_records_zero() {
        let mut fx = Fixture::new(&["a", "b"]);
        let mut stage = UltimatumRound::default();
        stage.on_enter(&mut fx.ctx()).unwrap();
        let (bidder, respondent) = fx.pair();

        stage
            .on_participant_event(&mut fx.ctx(), &bidder, &ParticipantEvent::Offer { value: 10 })
            .unwrap();
        stage
            .on_participant_event(
                &mut fx.ctx(),
                &respondent,
                &ParticipantEvent::Response { accept: false },
            )
            .unwrap();

        assert!(fx.ledger.has_credit(&bidder, 1));
        assert_eq!(fx.ledger.total(&bidder), 0);
        assert_eq!(fx.ledger.total(&respondent), 0);
    }

    #[test]
    fn second_response_is_a_duplicate_credit() {
        let mut fx = Fixture::new(&["a", "b"]);
        let mut stage = UltimatumRound::default();
        stage.on_enter(&mut fx.ctx()).unwrap();
        let (bidder, respondent) = fx.pair();

        stage
            .on_participant_event(&mut fx.ctx(), &bidder, &ParticipantEvent::Offer { value: 50 })
            .unwrap();
        let accept = ParticipantEvent::Response { accept: true };
        stage
            .on_participant_event(&mut fx.ctx(), &respondent, &accept)
            .unwrap();
        let err = stage
            .on_participant_event(&mut fx.ctx(), &respondent, &accept)
            .unwrap_err();

        assert!(matches!(
            err,
            StageError::Ledger(LedgerError::DuplicateCredit { .. })
        ));
        assert_eq!(fx.ledger.total(&respondent), 50);
        assert_eq!(fx.ledger.total(&bidder), 50);
    }

    #[test]
    fn exchange_is_not_half_credited() {
        let mut fx = Fixture::new(&["a", "b"]);
        let mut stage = UltimatumRound::default();
        stage.on_enter(&mut fx.ctx()).unwrap();
        let (bidder, respondent) = fx.pair();
        fx.ctx().credit(&bidder, 5).unwrap();

        stage
            .on_participant_event(&mut fx.ctx(), &bidder, &ParticipantEvent::Offer { value: 30 })
            .unwrap();
        let err = stage
            .on_participant_event(
                &mut fx.ctx(),
                &respondent,
                &ParticipantEvent::Response { accept: true },
            )
            .unwrap_err();

        assert_eq!(
            err,
            StageError::Ledger(LedgerError::DuplicateCredit {
                participant: bidder.clone(),
                round: 1,
            })
        );
        assert!(!fx.ledger.has_credit(&respondent, 1));
        assert_eq!(fx.ledger.total(&respondent), 0);
        assert_eq!(fx.ledger.total(&bidder), 5);
        assert!(!fx
            .transport
            .sent_to(&respondent)
            .iter()
            .any(|m| matches!(m, ServerMsg::RoundResult { .. })));
    }

    #[test]
    fn roles_are_enforced() {
        let mut fx = Fixture::new(&["a", "b"]);
        let mut stage = UltimatumRound::default();
        stage.on_enter(&mut fx.ctx()).unwrap();
        let (bidder, respondent) = fx.pair();

        let err = stage
            .on_participant_event(
                &mut fx.ctx(),
                &respondent,
                &ParticipantEvent::Offer { value: 5 },
            )
            .unwrap_err();
        assert!(matches!(err, StageError::WrongRole { .. }));

        let err = stage
            .on_participant_event(&mut fx.ctx(), &bidder, &ParticipantEvent::Offer { value: 101 })
            .unwrap_err();
        assert_eq!(err, StageError::InvalidOffer(101));

        let err = stage
            .on_participant_event(
                &mut fx.ctx(),
                &respondent,
                &ParticipantEvent::Response { accept: true },
            )
            .unwrap_err();
        assert_eq!(err, StageError::NoPendingOffer(bidder));
    }

    #[test]
    fn round_end_discards_assignment() {
        let mut fx = Fixture::new(&["a", "b", "c"]);
        let mut stage = UltimatumRound::default();
        stage.on_enter(&mut fx.ctx()).unwrap();
        assert_eq!(fx.assignment.as_ref().unwrap().sitting_out().count(), 1);
        assert!(fx.state.roster.values().all(|p| p.role.is_some()));

        stage.on_complete(&mut fx.ctx()).unwrap();
        assert!(fx.assignment.is_none());
        assert!(fx.state.roster.values().all(|p| p.role.is_none()));
    }

    #[test]
    fn endgame_announces_wins_and_completes() {
        let mut fx = Fixture::new(&["a", "b"]);
        fx.ledger.credit(&ParticipantId::new("a"), 1, 70).unwrap();

        let signal = Endgame.on_enter(&mut fx.ctx()).unwrap();
        assert_eq!(signal, StageSignal::Complete);
        assert_eq!(
            fx.transport.sent_to(&ParticipantId::new("a")),
            vec![ServerMsg::Win { amount: 70 }]
        );
        assert_eq!(
            fx.transport.sent_to(&ParticipantId::new("b")),
            vec![ServerMsg::Win { amount: 0 }]
        );
    }
}
