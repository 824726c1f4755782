use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::ValidationError;
use crate::evaluation::Tier;
use crate::tiers::metric;

/// Configured weights must sum to 1.0 within this bound.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

/// Upper bound on any configured timeout (one day).
pub const MAX_TIMEOUT_MS: u64 = 86_400_000;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML settings: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Built once by [`Settings::load`] and shared across evaluations behind an
/// `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub weights: WeightTable,
    pub redistribution: RedistributionStrategy,
    pub timeouts: TimeoutSettings,
    pub enabled_tiers: EnabledTiers,
    pub recommendations: Vec<RecommendationThreshold>,
    pub judge: JudgeSettings,
    pub traditional: TraditionalSettings,
    pub graph: GraphSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            weights: WeightTable::default(),
            redistribution: RedistributionStrategy::default(),
            timeouts: TimeoutSettings::default(),
            enabled_tiers: EnabledTiers::default(),
            recommendations: default_recommendations(),
            judge: JudgeSettings::default(),
            traditional: TraditionalSettings::default(),
            graph: GraphSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_yaml_str(raw: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads a `.json` file as JSON and anything else as YAML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.weights.validate()?;
        self.timeouts.validate()?;
        validate_recommendations(&self.recommendations)?;
        self.judge.validate()?;
        self.traditional.validate()?;
        Ok(())
    }

    pub fn tier_timeout(&self, tier: Tier) -> Duration {
        self.timeouts.tier_timeout(tier)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        self.timeouts.pipeline_timeout()
    }

    /// Highest category whose threshold the score reaches. A score sitting
    /// exactly on a boundary takes the higher category.
    pub fn recommend(&self, score: f64) -> String {
        let mut thresholds: Vec<&RecommendationThreshold> = self.recommendations.iter().collect();
        thresholds.sort_by(|a, b| {
            b.min_score
                .partial_cmp(&a.min_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        thresholds
            .iter()
            .find(|t| score >= t.min_score)
            .or_else(|| thresholds.last())
            .map(|t| t.category.clone())
            .unwrap_or_default()
    }
}

/// Per-metric weights grouped by the tier that produces the metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeightTable {
    pub tier1: BTreeMap<String, f64>,
    pub tier2: BTreeMap<String, f64>,
    pub tier3: BTreeMap<String, f64>,
}

impl Default for WeightTable {
    fn default() -> Self {
        let tier1 = BTreeMap::from([
            (metric::COSINE_SIMILARITY.to_string(), 0.10),
            (metric::JACCARD_SIMILARITY.to_string(), 0.05),
            (metric::STRUCTURAL_COMPLETENESS.to_string(), 0.10),
            (metric::TIME_EFFICIENCY.to_string(), 0.10),
        ]);
        let tier2 = BTreeMap::from([
            (metric::TECHNICAL_ACCURACY.to_string(), 0.15),
            (metric::CONSTRUCTIVENESS.to_string(), 0.10),
            (metric::PLANNING_RATIONALITY.to_string(), 0.10),
        ]);
        let tier3 = BTreeMap::from([
            (metric::PATH_CONVERGENCE.to_string(), 0.10),
            (metric::TOOL_SELECTION_ACCURACY.to_string(), 0.10),
            (metric::COORDINATION_QUALITY.to_string(), 0.10),
        ]);
        Self {
            tier1,
            tier2,
            tier3,
        }
    }
}

impl WeightTable {
    pub fn for_tier(&self, tier: Tier) -> &BTreeMap<String, f64> {
        match tier {
            Tier::Traditional => &self.tier1,
            Tier::Judge => &self.tier2,
            Tier::Graph => &self.tier3,
        }
    }

    /// All `(tier, metric, weight)` triples in tier then metric order.
    pub fn entries(&self) -> Vec<(Tier, &str, f64)> {
        Tier::ALL
            .iter()
            .flat_map(|tier| {
                self.for_tier(*tier)
                    .iter()
                    .map(move |(name, weight)| (*tier, name.as_str(), *weight))
            })
            .collect()
    }

    pub fn total(&self) -> f64 {
        self.entries().iter().map(|(_, _, w)| w).sum()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = BTreeSet::new();
        for (_, name, weight) in self.entries() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ValidationError::InvalidWeight {
                    metric: name.to_string(),
                    weight,
                });
            }
            if !seen.insert(name) {
                return Err(invalid(
                    &format!("weights.{}", name),
                    "metric is weighted in more than one tier",
                ));
            }
        }
        let sum = self.total();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ValidationError::WeightSum { sum });
        }
        Ok(())
    }
}

/// How weight removed from the pool is handed to the remaining metrics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RedistributionStrategy {
    /// Every remaining metric receives the same share.
    #[default]
    Equal,
    /// Remaining metrics are rescaled in proportion to their configured weight.
    Proportional,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PipelineBudget {
    Sum,
    Max,
    Fixed { ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutSettings {
    pub tier1_ms: u64,
    pub tier2_ms: u64,
    pub tier3_ms: u64,
    pub pipeline: PipelineBudget,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            tier1_ms: 10_000,
            tier2_ms: 120_000,
            tier3_ms: 10_000,
            pipeline: PipelineBudget::Sum,
        }
    }
}

impl TimeoutSettings {
    pub fn tier_timeout(&self, tier: Tier) -> Duration {
        Duration::from_millis(match tier {
            Tier::Traditional => self.tier1_ms,
            Tier::Judge => self.tier2_ms,
            Tier::Graph => self.tier3_ms,
        })
    }

    pub fn pipeline_timeout(&self) -> Duration {
        match self.pipeline {
            PipelineBudget::Sum => Duration::from_millis(
                self.tier1_ms
                    .saturating_add(self.tier2_ms)
                    .saturating_add(self.tier3_ms),
            ),
            PipelineBudget::Max => {
                Duration::from_millis(self.tier1_ms.max(self.tier2_ms).max(self.tier3_ms))
            }
            PipelineBudget::Fixed { ms } => Duration::from_millis(ms),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("timeouts.tier1_ms", self.tier1_ms),
            ("timeouts.tier2_ms", self.tier2_ms),
            ("timeouts.tier3_ms", self.tier3_ms),
        ] {
            check_timeout(field, value)?;
        }
        if let PipelineBudget::Fixed { ms } = self.pipeline {
            check_timeout("timeouts.pipeline.ms", ms)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnabledTiers {
    pub tier1: bool,
    pub tier2: bool,
    pub tier3: bool,
}

impl Default for EnabledTiers {
    fn default() -> Self {
        Self {
            tier1: true,
            tier2: true,
            tier3: true,
        }
    }
}

impl EnabledTiers {
    pub fn is_enabled(&self, tier: Tier) -> bool {
        match tier {
            Tier::Traditional => self.tier1,
            Tier::Judge => self.tier2,
            Tier::Graph => self.tier3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationThreshold {
    pub category: String,
    pub min_score: f64,
}

impl RecommendationThreshold {
    pub fn new(category: impl Into<String>, min_score: f64) -> Self {
        Self {
            category: category.into(),
            min_score,
        }
    }
}

fn default_recommendations() -> Vec<RecommendationThreshold> {
    vec![
        RecommendationThreshold::new("accept", 0.8),
        RecommendationThreshold::new("weak_accept", 0.6),
        RecommendationThreshold::new("weak_reject", 0.4),
        RecommendationThreshold::new("reject", 0.0),
    ]
}

fn validate_recommendations(thresholds: &[RecommendationThreshold]) -> Result<(), ValidationError> {
    if thresholds.is_empty() {
        return Err(invalid("recommendations", "at least one category is required"));
    }
    let mut categories = BTreeSet::new();
    let mut bounds = Vec::with_capacity(thresholds.len());
    for t in thresholds {
        if t.category.trim().is_empty() {
            return Err(invalid("recommendations", "category names must not be empty"));
        }
        if !categories.insert(t.category.as_str()) {
            return Err(invalid(
                "recommendations",
                &format!("duplicate category {}", t.category),
            ));
        }
        if !t.min_score.is_finite() || !(0.0..=1.0).contains(&t.min_score) {
            return Err(invalid(
                "recommendations",
                &format!("min_score for {} must be within [0, 1]", t.category),
            ));
        }
        if bounds.iter().any(|b: &f64| (b - t.min_score).abs() < f64::EPSILON) {
            return Err(invalid(
                "recommendations",
                &format!("threshold {} is used twice", t.min_score),
            ));
        }
        bounds.push(t.min_score);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => f.write_str("openai"),
            ProviderKind::Anthropic => f.write_str("anthropic"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Judge provider chain in fallback order, plus retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JudgeSettings {
    pub providers: Vec<ProviderSettings>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub use_tier1_context: bool,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderSettings {
                    kind: ProviderKind::OpenAi,
                    model: "gpt-4o-mini".to_string(),
                    api_key_env: "OPENAI_API_KEY".to_string(),
                    base_url: None,
                },
                ProviderSettings {
                    kind: ProviderKind::Anthropic,
                    model: "claude-3-5-haiku-latest".to_string(),
                    api_key_env: "ANTHROPIC_API_KEY".to_string(),
                    base_url: None,
                },
            ],
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 8_000,
            request_timeout_ms: 30_000,
            use_tier1_context: true,
            temperature: 0.0,
            max_tokens: 1024,
        }
    }
}

impl JudgeSettings {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(invalid("judge.max_attempts", "must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(invalid("judge.backoff_multiplier", "must be at least 1.0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("judge.request_timeout_ms", "must be greater than zero"));
        }
        for (i, provider) in self.providers.iter().enumerate() {
            if provider.model.trim().is_empty() {
                return Err(invalid(
                    &format!("judge.providers[{}].model", i),
                    "must not be empty",
                ));
            }
            if provider.api_key_env.trim().is_empty() {
                return Err(invalid(
                    &format!("judge.providers[{}].api_key_env", i),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Rubric {
    /// Section headings or keywords the artifact is expected to contain.
    pub required_sections: Vec<String>,
    pub min_words: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecayFunction {
    /// Reaches zero at `zero_at_factor` times the target duration.
    Linear { zero_at_factor: f64 },
    /// Halves for every `half_life_secs` over the target.
    Exponential { half_life_secs: f64 },
}

impl Default for DecayFunction {
    fn default() -> Self {
        DecayFunction::Linear {
            zero_at_factor: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TraditionalSettings {
    pub rubric: Rubric,
    pub target_duration_secs: f64,
    pub decay: DecayFunction,
}

impl Default for TraditionalSettings {
    fn default() -> Self {
        Self {
            rubric: Rubric::default(),
            target_duration_secs: 300.0,
            decay: DecayFunction::default(),
        }
    }
}

impl TraditionalSettings {
    fn validate(&self) -> Result<(), ValidationError> {
        if !self.target_duration_secs.is_finite() || self.target_duration_secs <= 0.0 {
            return Err(invalid(
                "traditional.target_duration_secs",
                "must be a positive number",
            ));
        }
        match self.decay {
            DecayFunction::Linear { zero_at_factor } => {
                if !zero_at_factor.is_finite() || zero_at_factor <= 1.0 {
                    return Err(invalid(
                        "traditional.decay.zero_at_factor",
                        "must be greater than 1.0",
                    ));
                }
            }
            DecayFunction::Exponential { half_life_secs } => {
                if !half_life_secs.is_finite() || half_life_secs <= 0.0 {
                    return Err(invalid(
                        "traditional.decay.half_life_secs",
                        "must be a positive number",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphSettings {
    /// Known minimum number of interactions for the task, if any.
    pub optimal_steps: Option<usize>,
    /// Tools each agent may call. Agents not listed may call anything.
    pub tool_allowlist: BTreeMap<String, Vec<String>>,
}

fn check_timeout(field: &str, ms: u64) -> Result<(), ValidationError> {
    if ms == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    if ms > MAX_TIMEOUT_MS {
        return Err(invalid(
            field,
            &format!("must not exceed {} ms", MAX_TIMEOUT_MS),
        ));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidSetting {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
