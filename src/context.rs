use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EvaluationError, ValidationError};
use crate::evaluation::Tier;
use crate::settings::Settings;
use crate::trace::ExecutionTrace;

/// Artifact produced by the upstream agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    #[serde(default)]
    pub run_id: Option<String>,
    pub candidate: String,
    #[serde(default)]
    pub ground_truth: Vec<String>,
}

impl Artifact {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            run_id: None,
            candidate: candidate.into(),
            ground_truth: Vec::new(),
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.ground_truth.push(reference.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Everything a plugin may read about one evaluation. Built once, then only
/// shared by reference.
#[derive(Debug)]
pub struct EvaluationContext {
    run_id: String,
    candidate: String,
    ground_truth: Vec<String>,
    trace: ExecutionTrace,
    settings: Arc<Settings>,
}

impl EvaluationContext {
    pub fn new(
        run_id: impl Into<String>,
        artifact: Artifact,
        trace: ExecutionTrace,
        settings: Arc<Settings>,
    ) -> Result<Self, ValidationError> {
        if artifact.candidate.trim().is_empty() {
            return Err(ValidationError::EmptyCandidate);
        }
        trace.validate()?;
        settings.validate()?;
        Ok(Self {
            run_id: run_id.into(),
            candidate: artifact.candidate,
            ground_truth: artifact.ground_truth,
            trace,
            settings,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn ground_truth(&self) -> &[String] {
        &self.ground_truth
    }

    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            candidate_sha256: hex::encode(Sha256::digest(self.candidate.as_bytes())),
            candidate_chars: self.candidate.chars().count(),
            reference_count: self.ground_truth.len(),
            event_count: self.trace.len(),
            actor_count: self.trace.actor_ids().len(),
            trace_duration_ms: self.trace.duration_ms(),
        }
    }
}

/// What the trace store keeps about the inputs of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSummary {
    pub candidate_sha256: String,
    pub candidate_chars: usize,
    pub reference_count: usize,
    pub event_count: usize,
    pub actor_count: usize,
    pub trace_duration_ms: u64,
}

/// Payload handed from one tier to the next.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TierContext {
    /// No tier has produced anything yet.
    Initial,
    Traditional(TraditionalSummary),
    Judge(JudgeSummary),
    Empty,
}

impl TierContext {
    pub fn kind(&self) -> &'static str {
        match self {
            TierContext::Initial => "initial",
            TierContext::Traditional(_) => "traditional",
            TierContext::Judge(_) => "judge",
            TierContext::Empty => "empty",
        }
    }

    /// Schema check performed by the consuming tier.
    pub fn validate_for(&self, consumer: Tier) -> Result<(), EvaluationError> {
        let malformed = |reason: String| EvaluationError::MalformedContext {
            tier: consumer,
            reason,
        };
        match self {
            TierContext::Initial | TierContext::Empty => Ok(()),
            TierContext::Traditional(summary) => summary.validate().map_err(malformed),
            TierContext::Judge(summary) => summary.validate().map_err(malformed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraditionalSummary {
    /// Cosine similarity to the closest reference, if any reference exists.
    pub best_similarity: Option<f64>,
    pub matched_reference: Option<usize>,
    pub structural_completeness: f64,
    pub time_efficiency: f64,
    pub candidate_tokens: usize,
}

impl TraditionalSummary {
    fn validate(&self) -> Result<(), String> {
        if let Some(similarity) = self.best_similarity {
            check_unit("best_similarity", similarity)?;
            if self.matched_reference.is_none() {
                return Err("best_similarity without matched_reference".to_string());
            }
        }
        check_unit("structural_completeness", self.structural_completeness)?;
        check_unit("time_efficiency", self.time_efficiency)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeSummary {
    pub provider: String,
    pub model: String,
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl JudgeSummary {
    fn validate(&self) -> Result<(), String> {
        if self.provider.is_empty() || self.model.is_empty() {
            return Err("judge summary is missing provider or model".to_string());
        }
        for (name, score) in &self.scores {
            check_unit(name, *score)?;
        }
        Ok(())
    }
}

fn check_unit(field: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} is outside [0, 1]: {}", field, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::fixtures::four_agent_trace;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    #[test]
    fn test_context_rejects_empty_candidate() {
        let err = EvaluationContext::new(
            "run-1",
            Artifact::new("   "),
            ExecutionTrace::default(),
            settings(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::EmptyCandidate);
    }

    #[test]
    fn test_context_rejects_invalid_settings() {
        let mut bad = Settings::default();
        bad.weights.tier2.clear();
        let err = EvaluationContext::new(
            "run-1",
            Artifact::new("report"),
            ExecutionTrace::default(),
            Arc::new(bad),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::WeightSum { .. }));
    }

    #[test]
    fn test_summary_digest_is_stable() {
        let ctx = EvaluationContext::new(
            "run-1",
            Artifact::new("hello").with_reference("hello world"),
            four_agent_trace(),
            settings(),
        )
        .unwrap();
        let summary = ctx.summary();
        assert_eq!(
            summary.candidate_sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(summary.candidate_chars, 5);
        assert_eq!(summary.reference_count, 1);
        assert_eq!(summary.event_count, 9);
        assert_eq!(summary.actor_count, 8);
    }

    #[test]
    fn test_traditional_context_out_of_range_rejected() {
        let ctx = TierContext::Traditional(TraditionalSummary {
            best_similarity: Some(1.4),
            matched_reference: Some(0),
            structural_completeness: 1.0,
            time_efficiency: 1.0,
            candidate_tokens: 3,
        });
        let err = ctx.validate_for(Tier::Judge).unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::MalformedContext {
                tier: Tier::Judge,
                ..
            }
        ));
    }

    #[test]
    fn test_traditional_context_requires_matched_reference() {
        let ctx = TierContext::Traditional(TraditionalSummary {
            best_similarity: Some(0.4),
            matched_reference: None,
            structural_completeness: 1.0,
            time_efficiency: 1.0,
            candidate_tokens: 3,
        });
        assert!(ctx.validate_for(Tier::Judge).is_err());
    }

    #[test]
    fn test_judge_context_validation() {
        let good = TierContext::Judge(JudgeSummary {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            scores: BTreeMap::from([("technical_accuracy".to_string(), 0.7)]),
            rationale: None,
        });
        assert!(good.validate_for(Tier::Graph).is_ok());

        let bad = TierContext::Judge(JudgeSummary {
            provider: String::new(),
            model: "m".to_string(),
            scores: BTreeMap::new(),
            rationale: None,
        });
        assert!(bad.validate_for(Tier::Graph).is_err());
    }

    #[test]
    fn test_tier_context_serde_tag() {
        let json = serde_json::to_string(&TierContext::Initial).unwrap();
        assert_eq!(json, r#"{"kind":"initial"}"#);
    }
}
