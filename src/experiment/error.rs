//! Error taxonomy for the experiment core

use super::ParticipantId;

/// Stage registration errors (fail group setup before anyone joins)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    #[error("Stage id already registered for group '{group_type}': {stage_id}")]
    DuplicateStageId {
        group_type: String,
        stage_id: String,
    },

    #[error("Stage '{0}' must repeat at least once")]
    ZeroRepeat(String),

    #[error("Unknown group type: {0}")]
    UnknownGroupType(String),

    #[error("Group type '{0}' declares no stages")]
    EmptySequence(String),
}

/// Outcome ledger misuse, surfaced synchronously to the handler layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Participant {participant} already credited for round {round}")]
    DuplicateCredit { participant: ParticipantId, round: u32 },

    #[error("Settlement requested before the session ended")]
    SessionNotEnded,

    #[error("Ledger is closed; no further credits accepted")]
    Closed,
}

/// Connect events the session refuses
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Participant {0} is not part of this session")]
    UnauthorizedConnect(ParticipantId),
}

/// Internal stage handler failure; logged, never fatal
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("No round assignment for participant {0}")]
    NotMatched(ParticipantId),

    #[error("Participant {participant} cannot {action} as {role}")]
    WrongRole {
        participant: ParticipantId,
        role: &'static str,
        action: &'static str,
    },

    #[error("Offer out of range: {0}")]
    InvalidOffer(u64),

    #[error("Bidder {0} already made an offer this round")]
    OfferAlreadyMade(ParticipantId),

    #[error("No pending offer from bidder {0}")]
    NoPendingOffer(ParticipantId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Errors seen by callers of a [`SessionHandle`](super::SessionHandle)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session has been torn down")]
    Closed,

    #[error("No round assignment is active")]
    NoActiveRound,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}
