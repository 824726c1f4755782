use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::Tier;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Init,
    Tier1Running,
    Tier1Done,
    Tier1Skipped,
    Tier2Running,
    Tier2Done,
    Tier2Skipped,
    Tier3Running,
    Tier3Done,
    Tier3Skipped,
    Scoring,
    Done,
    Failed,
}

impl PipelineState {
    pub fn running(tier: Tier) -> Self {
        match tier {
            Tier::Traditional => PipelineState::Tier1Running,
            Tier::Judge => PipelineState::Tier2Running,
            Tier::Graph => PipelineState::Tier3Running,
        }
    }

    pub fn finished(tier: Tier, skipped: bool) -> Self {
        match (tier, skipped) {
            (Tier::Traditional, false) => PipelineState::Tier1Done,
            (Tier::Traditional, true) => PipelineState::Tier1Skipped,
            (Tier::Judge, false) => PipelineState::Tier2Done,
            (Tier::Judge, true) => PipelineState::Tier2Skipped,
            (Tier::Graph, false) => PipelineState::Tier3Done,
            (Tier::Graph, true) => PipelineState::Tier3Skipped,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (*self, next),
            (Init, Tier1Running)
                | (Init, Failed)
                | (Tier1Running, Tier1Done)
                | (Tier1Running, Tier1Skipped)
                | (Tier1Done, Tier2Running)
                | (Tier1Skipped, Tier2Running)
                | (Tier2Running, Tier2Done)
                | (Tier2Running, Tier2Skipped)
                | (Tier2Done, Tier3Running)
                | (Tier2Skipped, Tier3Running)
                | (Tier3Running, Tier3Done)
                | (Tier3Running, Tier3Skipped)
                | (Tier3Done, Scoring)
                | (Tier3Skipped, Scoring)
                | (Scoring, Done)
                | (Scoring, Failed)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("illegal pipeline transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub elapsed_ms: u64,
}

/// Tracks one evaluation through the pipeline state machine.
pub struct EvaluationProgress {
    run_id: String,
    state: PipelineState,
    started_at: Instant,
    last_transition: Instant,
    transitions: Vec<StateTransition>,
}

impl EvaluationProgress {
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = Instant::now();
        let run_id = run_id.into();
        debug!(run_id = %run_id, "Starting evaluation progress tracking");
        Self {
            run_id,
            state: PipelineState::Init,
            started_at: now,
            last_transition: now,
            transitions: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Every state visited so far, starting with `Init`.
    pub fn history(&self) -> Vec<PipelineState> {
        std::iter::once(PipelineState::Init)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }

    pub fn transition_to(&mut self, next: PipelineState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            warn!(
                run_id = %self.run_id,
                from = ?self.state,
                to = ?next,
                "Rejected illegal state transition"
            );
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_transition).as_millis() as u64;
        debug!(
            run_id = %self.run_id,
            from = ?self.state,
            to = ?next,
            elapsed_ms = %elapsed,
            "State transition"
        );

        self.transitions.push(StateTransition {
            from: self.state,
            to: next,
            elapsed_ms: elapsed,
        });
        self.state = next;
        self.last_transition = now;
        Ok(())
    }

    pub fn begin_tier(&mut self, tier: Tier) -> Result<(), IllegalTransition> {
        self.transition_to(PipelineState::running(tier))
    }

    pub fn finish_tier(&mut self, tier: Tier, skipped: bool) -> Result<(), IllegalTransition> {
        self.transition_to(PipelineState::finished(tier, skipped))
    }

    pub fn complete(&mut self) -> Result<(), IllegalTransition> {
        self.transition_to(PipelineState::Done)?;
        info!(
            run_id = %self.run_id,
            elapsed_ms = %self.elapsed_ms(),
            "Evaluation completed"
        );
        Ok(())
    }

    pub fn fail(&mut self) -> Result<(), IllegalTransition> {
        self.transition_to(PipelineState::Failed)?;
        warn!(
            run_id = %self.run_id,
            elapsed_ms = %self.elapsed_ms(),
            "Evaluation failed"
        );
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk_tiers(progress: &mut EvaluationProgress, skipped: [bool; 3]) {
        for (tier, skip) in Tier::ALL.into_iter().zip(skipped) {
            progress.begin_tier(tier).unwrap();
            progress.finish_tier(tier, skip).unwrap();
        }
    }

    #[test]
    fn test_new_progress() {
        let progress = EvaluationProgress::new("run-1");
        assert_eq!(progress.state(), PipelineState::Init);
        assert_eq!(progress.run_id(), "run-1");
        assert!(progress.transitions().is_empty());
        assert!(!progress.is_terminal());
    }

    #[test]
    fn test_full_happy_path() {
        let mut progress = EvaluationProgress::new("run-1");
        walk_tiers(&mut progress, [false, true, false]);
        progress.transition_to(PipelineState::Scoring).unwrap();
        progress.complete().unwrap();

        assert!(progress.is_terminal());
        assert_eq!(
            progress.history(),
            vec![
                PipelineState::Init,
                PipelineState::Tier1Running,
                PipelineState::Tier1Done,
                PipelineState::Tier2Running,
                PipelineState::Tier2Skipped,
                PipelineState::Tier3Running,
                PipelineState::Tier3Done,
                PipelineState::Scoring,
                PipelineState::Done,
            ]
        );
    }

    #[test]
    fn test_validation_failure_from_init() {
        let mut progress = EvaluationProgress::new("run-1");
        progress.fail().unwrap();
        assert_eq!(progress.state(), PipelineState::Failed);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut progress = EvaluationProgress::new("run-1");
        let err = progress.begin_tier(Tier::Judge).unwrap_err();
        assert_eq!(err.from, PipelineState::Init);
        assert_eq!(progress.state(), PipelineState::Init);

        progress.begin_tier(Tier::Traditional).unwrap();
        assert!(progress.fail().is_err());
        assert!(progress.transition_to(PipelineState::Scoring).is_err());
        assert_eq!(progress.transitions().len(), 1);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut progress = EvaluationProgress::new("run-1");
        walk_tiers(&mut progress, [true, true, true]);
        progress.transition_to(PipelineState::Scoring).unwrap();
        progress.fail().unwrap();
        assert!(progress.complete().is_err());
        assert!(progress.begin_tier(Tier::Traditional).is_err());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&PipelineState::Tier2Skipped).unwrap();
        assert_eq!(json, "\"TIER2_SKIPPED\"");
    }
}
