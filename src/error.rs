use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluation::Tier;

/// Malformed evaluation input or settings. Always fatal for the evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("trace event {index} has an empty {field} actor id")]
    EmptyActorId { index: usize, field: &'static str },

    #[error("trace timestamps decrease at event {index}")]
    NonMonotonicTimestamps { index: usize },

    #[error("candidate artifact is empty")]
    EmptyCandidate,

    #[error("run id {0} has already been evaluated")]
    DuplicateRunId(String),

    #[error("metric weights sum to {sum:.4}, expected 1.0")]
    WeightSum { sum: f64 },

    #[error("weight for metric {metric} is invalid: {weight}")]
    InvalidWeight { metric: String, weight: f64 },

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: String, reason: String },
}

/// Raised by a plugin when the context it was handed cannot be evaluated.
#[derive(Error, Debug, Clone)]
pub enum EvaluationError {
    #[error("malformed tier context for {tier}: {reason}")]
    MalformedContext { tier: Tier, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("plugin failure: {0}")]
    Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoringError {
    #[error("no active metrics left to score")]
    NoActiveMetrics,

    #[error("active weights sum to {sum:.4} after redistribution")]
    WeightsNotNormalized { sum: f64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("plugin {name} is already registered for {tier}")]
    Duplicate { tier: Tier, name: String },

    #[error("plugin name must not be empty")]
    EmptyName,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("run {0} is already stored")]
    DuplicateRun(String),
}

/// Fatal failures returned from `Orchestrator::evaluate`. Anything recoverable
/// is recorded on the `CompositeResult` instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("input validation failed: {0}")]
    InputValidation(#[from] ValidationError),

    #[error("composite scoring failed: {0}")]
    CompositeScoring(#[from] ScoringError),

    #[error("trace store rejected result: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Kinds of recoverable conditions recorded on a composite result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PluginExecution,
    ProviderUnavailable,
    Timeout,
    Cancelled,
    MissingMetric,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PluginExecution => "plugin_execution",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::MissingMetric => "missing_metric",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoverableError {
    pub tier: Tier,
    #[serde(default)]
    pub plugin: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}
