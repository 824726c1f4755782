use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::progress::PipelineState;
use super::{PluginResult, Tier};
use crate::error::{RecoverableError, ScoringError};
use crate::settings::{RedistributionStrategy, Settings};
use crate::tiers::metric;

/// Redistributed weights must sum to 1.0 within this bound.
pub const NORMALIZED_SUM_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricContribution {
    pub tier: Tier,
    pub value: f64,
    pub weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RemovalReason {
    TierInactive,
    SingleAgentMode,
    Missing,
    ErrorMarked(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemovedMetric {
    pub metric: String,
    pub tier: Tier,
    pub configured_weight: f64,
    pub reason: RemovalReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedTier {
    pub tier: Tier,
    #[serde(default)]
    pub plugin: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub overall_score: f64,
    pub per_tier_scores: BTreeMap<Tier, f64>,
    pub breakdown: BTreeMap<String, MetricContribution>,
    pub weights_used: BTreeMap<String, f64>,
    pub removed: Vec<RemovedMetric>,
    pub single_agent_mode: bool,
}

/// Final, immutable outcome of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositeResult {
    pub run_id: String,
    pub overall_score: f64,
    pub recommendation: String,
    pub per_tier_scores: BTreeMap<Tier, f64>,
    pub breakdown: BTreeMap<String, MetricContribution>,
    pub weights_used: BTreeMap<String, f64>,
    pub single_agent_mode: bool,
    pub skipped_tiers: Vec<SkippedTier>,
    pub errors: Vec<RecoverableError>,
    pub plugin_results: Vec<PluginResult>,
    pub states: Vec<PipelineState>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl CompositeResult {
    pub fn is_partial(&self) -> bool {
        !self.skipped_tiers.is_empty()
    }

    pub fn tier_skipped(&self, tier: Tier) -> bool {
        self.skipped_tiers.iter().any(|s| s.tier == tier)
    }
}

/// Single-agent mode as reported by the graph tier.
pub fn detect_single_agent(results: &[PluginResult]) -> bool {
    results
        .iter()
        .filter(|r| r.tier == Tier::Graph)
        .any(|r| r.single_agent_mode == Some(true))
}

/// Metrics that cannot contribute are removed in one pass and their weight
/// is handed to the remaining metrics once, so the weights used sum to 1.0.
pub fn score(results: &[PluginResult], settings: &Settings) -> Result<ScoreOutcome, ScoringError> {
    let single_agent_mode = detect_single_agent(results);
    let active: BTreeSet<Tier> = results.iter().filter(|r| r.is_ok()).map(|r| r.tier).collect();

    let mut kept: Vec<(Tier, &str, f64, f64)> = Vec::new();
    let mut removed = Vec::new();

    for (tier, name, weight) in settings.weights.entries() {
        if weight <= 0.0 {
            continue;
        }
        let reason = if !active.contains(&tier) {
            Some(RemovalReason::TierInactive)
        } else if single_agent_mode && name == metric::COORDINATION_QUALITY {
            Some(RemovalReason::SingleAgentMode)
        } else {
            match lookup(results, tier, name) {
                Lookup::Value(value) => {
                    kept.push((tier, name, weight, value));
                    None
                }
                Lookup::Error(message) => Some(RemovalReason::ErrorMarked(message)),
                Lookup::Missing => Some(RemovalReason::Missing),
            }
        };
        if let Some(reason) = reason {
            removed.push(RemovedMetric {
                metric: name.to_string(),
                tier,
                configured_weight: weight,
                reason,
            });
        }
    }

    if kept.is_empty() {
        return Err(ScoringError::NoActiveMetrics);
    }

    let removed_weight: f64 = removed.iter().map(|r| r.configured_weight).sum();
    let kept_weight: f64 = kept.iter().map(|(_, _, w, _)| w).sum();
    let share = removed_weight / kept.len() as f64;

    let mut weights_used = BTreeMap::new();
    let mut breakdown = BTreeMap::new();
    for (tier, name, weight, value) in &kept {
        let adjusted = match settings.redistribution {
            RedistributionStrategy::Equal => weight + share,
            RedistributionStrategy::Proportional => weight / kept_weight,
        };
        weights_used.insert(name.to_string(), adjusted);
        breakdown.insert(
            name.to_string(),
            MetricContribution {
                tier: *tier,
                value: *value,
                weight: adjusted,
                contribution: adjusted * value,
            },
        );
    }

    let sum: f64 = weights_used.values().sum();
    if (sum - 1.0).abs() > NORMALIZED_SUM_TOLERANCE {
        return Err(ScoringError::WeightsNotNormalized { sum });
    }

    let overall_score = breakdown
        .values()
        .map(|m| m.contribution)
        .sum::<f64>()
        .clamp(0.0, 1.0);

    let mut per_tier_scores = BTreeMap::new();
    for tier in Tier::ALL {
        let (weighted, total) = breakdown
            .values()
            .filter(|m| m.tier == tier)
            .fold((0.0, 0.0), |(s, t), m| (s + m.contribution, t + m.weight));
        if total > 0.0 {
            per_tier_scores.insert(tier, (weighted / total).clamp(0.0, 1.0));
        }
    }

    debug!(
        overall_score = %overall_score,
        kept = kept.len(),
        removed = removed.len(),
        removed_weight = %removed_weight,
        single_agent_mode = single_agent_mode,
        "Computed composite score"
    );

    Ok(ScoreOutcome {
        overall_score,
        per_tier_scores,
        breakdown,
        weights_used,
        removed,
        single_agent_mode,
    })
}

enum Lookup {
    Value(f64),
    Error(String),
    Missing,
}

/// Last ok plugin of the tier that reports the metric wins.
fn lookup(results: &[PluginResult], tier: Tier, name: &str) -> Lookup {
    let mut found = Lookup::Missing;
    for result in results.iter().filter(|r| r.tier == tier && r.is_ok()) {
        if let Some(value) = result.metric(name) {
            found = Lookup::Value(value);
        } else if let Some(message) = result.metric_errors.get(name) {
            if !matches!(found, Lookup::Value(_)) {
                found = Lookup::Error(message.clone());
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier1() -> PluginResult {
        PluginResult::ok("traditional_metrics", Tier::Traditional)
            .with_metric(metric::COSINE_SIMILARITY, 0.9)
            .with_metric(metric::JACCARD_SIMILARITY, 0.8)
            .with_metric(metric::STRUCTURAL_COMPLETENESS, 1.0)
            .with_metric(metric::TIME_EFFICIENCY, 0.5)
    }

    fn tier2() -> PluginResult {
        PluginResult::ok("llm_judge", Tier::Judge)
            .with_metric(metric::TECHNICAL_ACCURACY, 0.7)
            .with_metric(metric::CONSTRUCTIVENESS, 0.6)
            .with_metric(metric::PLANNING_RATIONALITY, 0.8)
    }

    fn tier3(single_agent: bool) -> PluginResult {
        let mut result = PluginResult::ok("graph_metrics", Tier::Graph)
            .with_metric(metric::PATH_CONVERGENCE, 1.0)
            .with_metric(metric::TOOL_SELECTION_ACCURACY, 0.75)
            .with_metric(metric::COORDINATION_QUALITY, 0.6);
        result.single_agent_mode = Some(single_agent);
        result
    }

    fn skipped(tier: Tier) -> PluginResult {
        PluginResult::skipped("p", tier, "disabled")
    }

    fn assert_normalized(outcome: &ScoreOutcome) {
        let sum: f64 = outcome.weights_used.values().sum();
        assert!((sum - 1.0).abs() <= NORMALIZED_SUM_TOLERANCE, "sum = {}", sum);
    }

    #[test]
    fn test_all_tiers_use_configured_weights() {
        let settings = Settings::default();
        let outcome = score(&[tier1(), tier2(), tier3(false)], &settings).unwrap();
        assert_normalized(&outcome);
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.weights_used[metric::TECHNICAL_ACCURACY], 0.15);

        let expected: f64 = 0.1 * 0.9 + 0.05 * 0.8 + 0.1 * 1.0 + 0.1 * 0.5
            + 0.15 * 0.7 + 0.1 * 0.6 + 0.1 * 0.8
            + 0.1 * 1.0 + 0.1 * 0.75 + 0.1 * 0.6;
        assert!((outcome.overall_score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_weights_normalized_for_every_skip_combination() {
        for strategy in [RedistributionStrategy::Equal, RedistributionStrategy::Proportional] {
            let mut settings = Settings::default();
            settings.redistribution = strategy;
            for mask in 1u8..8 {
                let mut results = Vec::new();
                results.push(if mask & 1 != 0 { tier1() } else { skipped(Tier::Traditional) });
                results.push(if mask & 2 != 0 { tier2() } else { skipped(Tier::Judge) });
                results.push(if mask & 4 != 0 { tier3(false) } else { skipped(Tier::Graph) });

                let outcome = score(&results, &settings).unwrap();
                assert_normalized(&outcome);
                assert!((0.0..=1.0).contains(&outcome.overall_score));
            }
        }
    }

    #[test]
    fn test_everything_skipped_is_an_error() {
        let results = [
            skipped(Tier::Traditional),
            skipped(Tier::Judge),
            skipped(Tier::Graph),
        ];
        assert_eq!(
            score(&results, &Settings::default()),
            Err(ScoringError::NoActiveMetrics)
        );
    }

    #[test]
    fn test_judge_skip_redistributes_its_weight() {
        let results = [
            tier1(),
            PluginResult::skipped("llm_judge", Tier::Judge, "no_provider_available"),
            tier3(false),
        ];
        let outcome = score(&results, &Settings::default()).unwrap();
        assert_normalized(&outcome);
        for name in metric::JUDGE_METRICS {
            assert!(!outcome.weights_used.contains_key(name));
        }
        // 0.35 removed, spread over 7 metrics.
        assert!((outcome.weights_used[metric::COSINE_SIMILARITY] - 0.15).abs() < 1e-9);
        assert!(!outcome.per_tier_scores.contains_key(&Tier::Judge));
    }

    #[test]
    fn test_single_agent_excludes_coordination_quality() {
        let outcome = score(&[tier1(), tier2(), tier3(true)], &Settings::default()).unwrap();
        assert!(outcome.single_agent_mode);
        assert!(!outcome.weights_used.contains_key(metric::COORDINATION_QUALITY));
        assert!(outcome
            .removed
            .iter()
            .any(|r| r.reason == RemovalReason::SingleAgentMode));
        assert_normalized(&outcome);
    }

    #[test]
    fn test_single_agent_and_judge_skip_removed_in_one_pass() {
        let results = [
            tier1(),
            PluginResult::skipped("llm_judge", Tier::Judge, "no_provider_available"),
            tier3(true),
        ];
        let outcome = score(&results, &Settings::default()).unwrap();
        assert_eq!(outcome.removed.len(), 4);
        assert_eq!(outcome.weights_used.len(), 6);
        // 0.45 removed, spread over 6 metrics.
        assert!((outcome.weights_used[metric::PATH_CONVERGENCE] - 0.175).abs() < 1e-9);
        assert_normalized(&outcome);
    }

    #[test]
    fn test_proportional_redistribution_keeps_ratios() {
        let mut settings = Settings::default();
        settings.redistribution = RedistributionStrategy::Proportional;
        let results = [tier1(), skipped(Tier::Judge), tier3(false)];
        let outcome = score(&results, &settings).unwrap();

        let cosine = outcome.weights_used[metric::COSINE_SIMILARITY];
        let jaccard = outcome.weights_used[metric::JACCARD_SIMILARITY];
        assert!((cosine / jaccard - 2.0).abs() < 1e-9);
        assert!((cosine - 0.1 / 0.65).abs() < 1e-9);
        assert_normalized(&outcome);
    }

    #[test]
    fn test_error_marked_metric_is_removed() {
        let t1 = PluginResult::ok("traditional_metrics", Tier::Traditional)
            .with_metric_error(metric::COSINE_SIMILARITY, "no_ground_truth")
            .with_metric_error(metric::JACCARD_SIMILARITY, "no_ground_truth")
            .with_metric(metric::STRUCTURAL_COMPLETENESS, 1.0)
            .with_metric(metric::TIME_EFFICIENCY, 1.0);
        let outcome = score(&[t1, tier2(), tier3(false)], &Settings::default()).unwrap();

        assert!(!outcome.weights_used.contains_key(metric::COSINE_SIMILARITY));
        assert!(outcome.removed.iter().any(|r| r.reason
            == RemovalReason::ErrorMarked("no_ground_truth".to_string())));
        assert_normalized(&outcome);
    }

    #[test]
    fn test_missing_metric_is_removed() {
        let t3 = PluginResult::ok("graph_metrics", Tier::Graph)
            .with_metric(metric::PATH_CONVERGENCE, 1.0);
        let outcome = score(&[tier1(), tier2(), t3], &Settings::default()).unwrap();
        let missing: Vec<&str> = outcome
            .removed
            .iter()
            .filter(|r| r.reason == RemovalReason::Missing)
            .map(|r| r.metric.as_str())
            .collect();
        assert_eq!(
            missing,
            vec![metric::COORDINATION_QUALITY, metric::TOOL_SELECTION_ACCURACY]
        );
    }

    #[test]
    fn test_per_tier_score_is_weighted_mean() {
        let outcome = score(&[tier1(), tier2(), tier3(false)], &Settings::default()).unwrap();
        let expected = (0.15 * 0.7 + 0.1 * 0.6 + 0.1 * 0.8) / 0.35;
        assert!((outcome.per_tier_scores[&Tier::Judge] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_zero_weight_metrics_are_ignored() {
        let mut settings = Settings::default();
        settings
            .weights
            .tier1
            .insert(metric::JACCARD_SIMILARITY.to_string(), 0.0);
        settings
            .weights
            .tier1
            .insert(metric::COSINE_SIMILARITY.to_string(), 0.15);
        let outcome = score(&[tier1(), tier2(), tier3(false)], &settings).unwrap();
        assert!(!outcome.weights_used.contains_key(metric::JACCARD_SIMILARITY));
        assert!(outcome.removed.is_empty());
    }
}
