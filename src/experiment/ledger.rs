//! Outcome ledger: at-most-once crediting and end-of-session settlement

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{error, info};

use crate::store::Checkout;

use super::error::LedgerError;
use super::{Ecu, ParticipantId};

/// A single applied credit. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub participant: ParticipantId,
    pub round: u32,
    pub amount: Ecu,
    pub applied: bool,
}

/// Final amount for one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub participant: ParticipantId,
    pub win: Ecu,
}

#[derive(Debug, Clone, Default)]
pub struct OutcomeLedger {
    entries: BTreeMap<(ParticipantId, u32), LedgerEntry>,
    totals: BTreeMap<ParticipantId, Ecu>,
    ended: bool,
    checked_out: BTreeSet<ParticipantId>,
}

impl OutcomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a round credit and return the participant's new total
    pub fn credit(
        &mut self,
        participant: &ParticipantId,
        round: u32,
        amount: Ecu,
    ) -> Result<Ecu, LedgerError> {
        if self.ended {
            return Err(LedgerError::Closed);
        }

        let key = (participant.clone(), round);
        if self.entries.contains_key(&key) {
            return Err(LedgerError::DuplicateCredit {
                participant: participant.clone(),
                round,
            });
        }

        self.entries.insert(
            key,
            LedgerEntry {
                participant: participant.clone(),
                round,
                amount,
                applied: true,
            },
        );
        let total = self.totals.entry(participant.clone()).or_insert(0);
        *total = total.saturating_add(amount);
        Ok(*total)
    }

    /// Running total, readable at any time by the session itself
    pub fn total(&self, participant: &ParticipantId) -> Ecu {
        self.totals.get(participant).copied().unwrap_or(0)
    }

    pub fn entries_for<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> impl Iterator<Item = &'a LedgerEntry> + 'a {
        self.entries
            .values()
            .filter(move |entry| &entry.participant == participant)
    }

    pub fn has_credit(&self, participant: &ParticipantId, round: u32) -> bool {
        self.entries.contains_key(&(participant.clone(), round))
    }

    /// Freeze the ledger at teardown; settlement becomes readable
    pub fn close(&mut self) {
        self.ended = true;
    }

    pub fn is_closed(&self) -> bool {
        self.ended
    }

    /// Final accumulated outcome; only after teardown
    pub fn settle(&self, participant: &ParticipantId) -> Result<Ecu, LedgerError> {
        if !self.ended {
            return Err(LedgerError::SessionNotEnded);
        }
        Ok(self.total(participant))
    }

    /// Settle and check out each participant once. Repeated calls skip
    /// participants already checked out; checkout failures are logged only.
    pub fn checkout_all(
        &mut self,
        participants: &[ParticipantId],
        checkout: &dyn Checkout,
    ) -> Result<Vec<Settlement>, LedgerError> {
        if !self.ended {
            return Err(LedgerError::SessionNotEnded);
        }

        let mut settlements = Vec::new();
        for participant in participants {
            if !self.checked_out.insert(participant.clone()) {
                continue;
            }
            let win = self.total(participant);
            if let Err(e) = checkout.checkout(participant, win) {
                error!(participant = %participant, error = %e, "Checkout failed");
            }
            settlements.push(Settlement {
                participant: participant.clone(),
                win,
            });
        }

        info!(settled = settlements.len(), "Ledger settled");
        Ok(settlements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::checkout::RecordingCheckout;
    use tokio_test::{assert_err, assert_ok};

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    #[test]
    fn duplicate_credit_applies_once() {
        let mut ledger = OutcomeLedger::new();
        assert_eq!(ledger.credit(&pid("a"), 1, 60), Ok(60));

        let err = ledger.credit(&pid("a"), 1, 60).unwrap_err();
        assert_eq!(
            err,
            LedgerError::DuplicateCredit {
                participant: pid("a"),
                round: 1
            }
        );
        assert_eq!(ledger.total(&pid("a")), 60);
        assert_eq!(ledger.entries_for(&pid("a")).count(), 1);
    }

    #[test]
    fn totals_sum_across_rounds() {
        let mut ledger = OutcomeLedger::new();
        for (round, amount) in [(1, 10), (2, 55), (3, 0)] {
            assert_ok!(ledger.credit(&pid("a"), round, amount));
        }
        assert_ok!(ledger.credit(&pid("b"), 1, 90));

        ledger.close();
        assert_eq!(ledger.settle(&pid("a")), Ok(65));
        assert_eq!(ledger.settle(&pid("b")), Ok(90));
        assert_eq!(ledger.settle(&pid("nobody")), Ok(0));
    }

    #[test]
    fn settle_before_end_fails() {
        let mut ledger = OutcomeLedger::new();
        assert_ok!(ledger.credit(&pid("a"), 1, 5));
        assert_eq!(ledger.settle(&pid("a")), Err(LedgerError::SessionNotEnded));
    }

    #[test]
    fn closed_ledger_rejects_credits() {
        let mut ledger = OutcomeLedger::new();
        ledger.close();
        assert_eq!(ledger.credit(&pid("a"), 1, 5), Err(LedgerError::Closed));
    }

    #[test]
    fn checkout_happens_once_per_participant() {
        let checkout = RecordingCheckout::default();
        let mut ledger = OutcomeLedger::new();
        assert_ok!(ledger.credit(&pid("a"), 1, 60));
        assert_ok!(ledger.credit(&pid("b"), 1, 40));

        assert_err!(ledger.checkout_all(&[pid("a")], &checkout));
        ledger.close();

        let settled = ledger.checkout_all(&[pid("a"), pid("b")], &checkout).unwrap();
        assert_eq!(settled.len(), 2);
        let again = ledger.checkout_all(&[pid("a"), pid("b")], &checkout).unwrap();
        assert!(again.is_empty());

        assert_eq!(checkout.calls(), vec![(pid("a"), 60), (pid("b"), 40)]);
    }
}
