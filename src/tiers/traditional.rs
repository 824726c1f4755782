use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::metric;
use crate::context::{EvaluationContext, TierContext, TraditionalSummary};
use crate::error::EvaluationError;
use crate::evaluation::{EvaluatorPlugin, PluginResult, Tier};
use crate::settings::{DecayFunction, Rubric};

pub const PLUGIN_NAME: &str = "traditional_metrics";

/// Tier 1. Computed locally from the candidate, the references and the trace
/// timestamps, so the same context always yields the same scores.
pub struct TraditionalMetricsPlugin {
    name: String,
}

impl TraditionalMetricsPlugin {
    pub fn new() -> Self {
        Self {
            name: PLUGIN_NAME.to_string(),
        }
    }
}

impl Default for TraditionalMetricsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EvaluatorPlugin for TraditionalMetricsPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> Tier {
        Tier::Traditional
    }

    async fn evaluate(
        &self,
        context: &EvaluationContext,
        upstream: &TierContext,
    ) -> Result<PluginResult, EvaluationError> {
        if !matches!(upstream, TierContext::Initial) {
            return Err(EvaluationError::MalformedContext {
                tier: Tier::Traditional,
                reason: format!("expected initial context, got {}", upstream.kind()),
            });
        }

        let settings = &context.settings().traditional;
        let candidate = tokenize(context.candidate());
        let mut result = PluginResult::ok(&self.name, Tier::Traditional);

        match best_reference(&candidate, context.ground_truth()) {
            Some(best) => {
                result = result
                    .with_metric(metric::COSINE_SIMILARITY, best.cosine)
                    .with_metric(metric::JACCARD_SIMILARITY, best.jaccard);
                result.metadata = serde_json::json!({
                    "matched_reference": best.index,
                    "candidate_tokens": candidate.len(),
                });
            }
            None => {
                result = result
                    .with_metric_error(metric::COSINE_SIMILARITY, "no_ground_truth")
                    .with_metric_error(metric::JACCARD_SIMILARITY, "no_ground_truth");
                result.metadata = serde_json::json!({
                    "candidate_tokens": candidate.len(),
                });
            }
        }

        let duration_secs = context.trace().duration_ms() as f64 / 1000.0;
        let structural = structural_completeness(context.candidate(), &settings.rubric);
        let efficiency = time_efficiency(duration_secs, settings.target_duration_secs, settings.decay);

        debug!(
            run_id = %context.run_id(),
            structural = %structural,
            duration_secs = %duration_secs,
            efficiency = %efficiency,
            "Computed traditional metrics"
        );

        Ok(result
            .with_metric(metric::STRUCTURAL_COMPLETENESS, structural)
            .with_metric(metric::TIME_EFFICIENCY, efficiency))
    }

    fn context_for_next_tier(&self, result: &PluginResult) -> TierContext {
        TierContext::Traditional(TraditionalSummary {
            best_similarity: result.metric(metric::COSINE_SIMILARITY),
            matched_reference: result
                .metadata
                .get("matched_reference")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
            structural_completeness: result
                .metric(metric::STRUCTURAL_COMPLETENESS)
                .unwrap_or_default(),
            time_efficiency: result.metric(metric::TIME_EFFICIENCY).unwrap_or_default(),
            candidate_tokens: result
                .metadata
                .get("candidate_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or_default() as usize,
        })
    }
}

struct ReferenceMatch {
    index: usize,
    cosine: f64,
    jaccard: f64,
}

/// Reference with the highest cosine similarity; the first one wins ties.
fn best_reference(candidate: &[String], references: &[String]) -> Option<ReferenceMatch> {
    let mut best: Option<ReferenceMatch> = None;
    for (index, reference) in references.iter().enumerate() {
        let tokens = tokenize(reference);
        let cosine = cosine_similarity(candidate, &tokens);
        if best.as_ref().map_or(true, |b| cosine > b.cosine) {
            best = Some(ReferenceMatch {
                index,
                cosine,
                jaccard: jaccard_similarity(candidate, &tokens),
            });
        }
    }
    best
}

/// Lowercased alphanumeric runs.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn term_frequencies(tokens: &[String]) -> BTreeMap<&str, f64> {
    let mut freq = BTreeMap::new();
    for token in tokens {
        *freq.entry(token.as_str()).or_insert(0.0) += 1.0;
    }
    freq
}

pub fn cosine_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let fa = term_frequencies(a);
    let fb = term_frequencies(b);
    if fa == fb {
        return 1.0;
    }
    let dot: f64 = fa
        .iter()
        .filter_map(|(term, count)| fb.get(term).map(|other| count * other))
        .sum();
    let norm_a = fa.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b = fb.values().map(|v| v * v).sum::<f64>().sqrt();
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

pub fn jaccard_similarity(a: &[String], b: &[String]) -> f64 {
    let sa: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let sb: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    intersection / union
}

/// Fraction of rubric items the candidate satisfies. Each required section is
/// one item (matched case-insensitively against candidate lines), the minimum
/// word count is another when set.
pub fn structural_completeness(candidate: &str, rubric: &Rubric) -> f64 {
    let mut items = 0usize;
    let mut satisfied = 0usize;

    let lines: Vec<String> = candidate.lines().map(|l| l.to_lowercase()).collect();
    for section in &rubric.required_sections {
        let needle = section.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        items += 1;
        if lines.iter().any(|line| line.contains(&needle)) {
            satisfied += 1;
        }
    }

    if rubric.min_words > 0 {
        items += 1;
        if candidate.split_whitespace().count() >= rubric.min_words {
            satisfied += 1;
        }
    }

    if items == 0 {
        1.0
    } else {
        satisfied as f64 / items as f64
    }
}

pub fn time_efficiency(duration_secs: f64, target_secs: f64, decay: DecayFunction) -> f64 {
    if duration_secs <= target_secs {
        return 1.0;
    }
    let over = duration_secs - target_secs;
    let score = match decay {
        DecayFunction::Linear { zero_at_factor } => {
            1.0 - over / (target_secs * (zero_at_factor - 1.0))
        }
        DecayFunction::Exponential { half_life_secs } => 0.5f64.powf(over / half_life_secs),
    };
    score.clamp(0.0, 1.0)
}
