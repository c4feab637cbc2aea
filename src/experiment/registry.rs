//! Stage registry: the ordered plot each group type steps through

use std::collections::HashMap;
use std::sync::Arc;

use super::error::SetupError;
use super::stage::StageKind;

/// Group type served by the standard ultimatum plot
pub const ULTIMATUM_GROUP: &str = "ultimatum";

/// Minimum-participant condition gating entry into a stage.
///
/// When unmet, the sequencer arms the session's fatal countdown and waits
/// for the roster to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRule {
    pub min_players: usize,
}

impl AdmissionRule {
    pub fn min_players(min_players: usize) -> Self {
        Self { min_players }
    }

    pub fn is_satisfied(&self, connected: usize) -> bool {
        connected >= self.min_players
    }
}

/// A registered stage. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub id: String,
    pub kind: StageKind,
    pub admission: Option<AdmissionRule>,
    /// Number of rounds (always >= 1)
    pub repeat: u32,
}

impl StageDescriptor {
    pub fn new(id: impl Into<String>, kind: StageKind) -> Self {
        Self {
            id: id.into(),
            kind,
            admission: None,
            repeat: 1,
        }
    }

    pub fn with_min_players(mut self, min_players: usize) -> Self {
        self.admission = Some(AdmissionRule::min_players(min_players));
        self
    }

    pub fn repeated(mut self, times: u32) -> Self {
        self.repeat = times;
        self
    }
}

/// Ordered, read-only stage list handed to a session
pub type StagePlot = Arc<[StageDescriptor]>;

/// Registry of stage sequences keyed by group type
#[derive(Debug, Default)]
pub struct StageRegistry {
    sequences: HashMap<String, Vec<StageDescriptor>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry for the standard ultimatum experiment
    pub fn ultimatum(rounds: u32, min_players: usize) -> Result<Self, SetupError> {
        let mut registry = Self::new();
        let stages = [
            StageDescriptor::new("instructions", StageKind::Instructions)
                .with_min_players(min_players),
            StageDescriptor::new("quiz", StageKind::Quiz).with_min_players(min_players),
            StageDescriptor::new("ultimatum", StageKind::Ultimatum)
                .with_min_players(min_players)
                .repeated(rounds),
            StageDescriptor::new("questionnaire", StageKind::Questionnaire),
            StageDescriptor::new("endgame", StageKind::Endgame),
        ];
        for stage in stages {
            registry.register(ULTIMATUM_GROUP, stage)?;
        }
        Ok(registry)
    }

    /// Append a stage to a group type's sequence
    pub fn register(
        &mut self,
        group_type: &str,
        descriptor: StageDescriptor,
    ) -> Result<(), SetupError> {
        if descriptor.repeat == 0 {
            return Err(SetupError::ZeroRepeat(descriptor.id));
        }

        let sequence = self.sequences.entry(group_type.to_string()).or_default();
        if sequence.iter().any(|s| s.id == descriptor.id) {
            return Err(SetupError::DuplicateStageId {
                group_type: group_type.to_string(),
                stage_id: descriptor.id,
            });
        }

        sequence.push(descriptor);
        Ok(())
    }

    /// Ordered stages for a group type
    pub fn sequence_for(&self, group_type: &str) -> Result<StagePlot, SetupError> {
        let sequence = self
            .sequences
            .get(group_type)
            .ok_or_else(|| SetupError::UnknownGroupType(group_type.to_string()))?;

        if sequence.is_empty() {
            return Err(SetupError::EmptySequence(group_type.to_string()));
        }

        Ok(sequence.clone().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_stage_id_is_rejected() {
        let mut registry = StageRegistry::new();
        registry
            .register("g", StageDescriptor::new("quiz", StageKind::Quiz))
            .unwrap();

        let err = registry
            .register("g", StageDescriptor::new("quiz", StageKind::Questionnaire))
            .unwrap_err();

        assert_eq!(
            err,
            SetupError::DuplicateStageId {
                group_type: "g".to_string(),
                stage_id: "quiz".to_string(),
            }
        );
        assert_eq!(registry.sequence_for("g").unwrap().len(), 1);
    }

    #[test]
    fn same_id_allowed_in_different_group_types() {
        let mut registry = StageRegistry::new();
        registry
            .register("a", StageDescriptor::new("quiz", StageKind::Quiz))
            .unwrap();
        registry
            .register("b", StageDescriptor::new("quiz", StageKind::Quiz))
            .unwrap();
    }

    #[test]
    fn zero_repeat_is_a_setup_error() {
        let mut registry = StageRegistry::new();
        let err = registry
            .register(
                "g",
                StageDescriptor::new("ultimatum", StageKind::Ultimatum).repeated(0),
            )
            .unwrap_err();
        assert_eq!(err, SetupError::ZeroRepeat("ultimatum".to_string()));
    }

    #[test]
    fn ultimatum_plot_keeps_registration_order() {
        let registry = StageRegistry::ultimatum(3, 2).unwrap();
        let plot = registry.sequence_for(ULTIMATUM_GROUP).unwrap();

        let ids: Vec<&str> = plot.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            ["instructions", "quiz", "ultimatum", "questionnaire", "endgame"]
        );
        assert_eq!(plot[2].repeat, 3);
        assert_eq!(plot[0].admission, Some(AdmissionRule::min_players(2)));
        assert_eq!(plot[3].admission, None);
        assert_eq!(plot[2].kind, StageKind::Ultimatum);
    }

    #[test]
    fn unknown_group_type() {
        let registry = StageRegistry::new();
        assert_eq!(
            registry.sequence_for("nope").unwrap_err(),
            SetupError::UnknownGroupType("nope".to_string())
        );
    }
}
