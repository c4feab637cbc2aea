//! Experiment core: stage sequencing, matching, lifecycle and payoffs

pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod matching;
pub mod registry;
pub mod sequencer;
pub mod session;
pub mod stage;

pub use error::{SessionError, SetupError};
pub use registry::StageRegistry;
pub use sequencer::{Session, SessionHandle, SessionRegistry, SessionReport};
pub use session::{SessionId, SessionIdGenerator};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque participant identifier, stable across reconnects
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Points earned in the task stage (experimental currency units)
pub type Ecu = u64;
