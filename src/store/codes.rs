//! Participant access/exit codes loaded from disk

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::experiment::ParticipantId;

/// One row of the codes file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRecord {
    pub id: ParticipantId,
    #[serde(rename = "AccessCode")]
    pub access_code: String,
    #[serde(rename = "ExitCode")]
    pub exit_code: String,
}

/// Expected participant set plus their checkout codes
#[derive(Debug)]
pub struct CodeStore {
    codes: HashMap<ParticipantId, CodeRecord>,
    /// Converted payoff recorded at checkout
    wins: Mutex<HashMap<ParticipantId, f64>>,
}

impl CodeStore {
    pub fn from_records(records: Vec<CodeRecord>) -> Result<Self, CodeStoreError> {
        if records.is_empty() {
            return Err(CodeStoreError::Empty);
        }

        let mut codes = HashMap::with_capacity(records.len());
        for record in records {
            if codes.contains_key(&record.id) {
                return Err(CodeStoreError::Duplicate(record.id));
            }
            codes.insert(record.id.clone(), record);
        }

        Ok(Self {
            codes,
            wins: Mutex::new(HashMap::new()),
        })
    }

    /// Load a JSON array of code records
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CodeStoreError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(CodeStoreError::Io)?;
        let records: Vec<CodeRecord> = serde_json::from_str(&raw).map_err(CodeStoreError::Parse)?;
        Self::from_records(records)
    }

    pub fn is_authorized(&self, participant: &ParticipantId) -> bool {
        self.codes.contains_key(participant)
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&CodeRecord> {
        self.codes.get(participant)
    }

    pub fn record_win(&self, participant: &ParticipantId, amount: f64) {
        self.wins.lock().insert(participant.clone(), amount);
    }

    pub fn win(&self, participant: &ParticipantId) -> Option<f64> {
        self.wins.lock().get(participant).copied()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodeStoreError {
    #[error("Failed to read codes file: {0}")]
    Io(std::io::Error),

    #[error("Failed to parse codes file: {0}")]
    Parse(serde_json::Error),

    #[error("No codes found")]
    Empty,

    #[error("Duplicate code entry for participant {0}")]
    Duplicate(ParticipantId),
}
