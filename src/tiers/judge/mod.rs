pub mod provider;
pub mod retry;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use provider::{HttpProviderFactory, JudgeProvider, JudgeRequest, ProviderError, ProviderFactory};
pub use retry::{with_retry, RetryConfig};

use super::metric;
use crate::context::{EvaluationContext, JudgeSummary, TierContext, TraditionalSummary};
use crate::error::EvaluationError;
use crate::evaluation::{EvaluatorPlugin, PluginResult, Tier};

pub const PLUGIN_NAME: &str = "llm_judge";

const SYSTEM_PROMPT: &str = "You are a strict reviewer grading the output of an autonomous agent. \
Score the candidate on three criteria, each a number between 0.0 and 1.0: \
technical_accuracy (are the claims and technical details correct), \
constructiveness (is the output actionable and useful), \
planning_rationality (is the approach well reasoned and ordered). \
Reply with a single JSON object: \
{\"technical_accuracy\": x, \"constructiveness\": x, \"planning_rationality\": x, \"rationale\": \"...\"}";

/// Parsed judge reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JudgeVerdict {
    pub technical_accuracy: f64,
    pub constructiveness: f64,
    pub planning_rationality: f64,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl JudgeVerdict {
    fn scores(&self) -> [(&'static str, f64); 3] {
        [
            (metric::TECHNICAL_ACCURACY, self.technical_accuracy),
            (metric::CONSTRUCTIVENESS, self.constructiveness),
            (metric::PLANNING_RATIONALITY, self.planning_rationality),
        ]
    }
}

/// Extracts the outermost JSON object from a completion, tolerating prose or
/// code fences around it.
pub fn parse_verdict(raw: &str) -> Result<JudgeVerdict, String> {
    let start = raw.find('{').ok_or("no JSON object in judge response")?;
    let end = raw.rfind('}').ok_or("no JSON object in judge response")?;
    if end < start {
        return Err("no JSON object in judge response".to_string());
    }
    let verdict: JudgeVerdict =
        serde_json::from_str(&raw[start..=end]).map_err(|e| format!("unparseable verdict: {}", e))?;
    for (name, score) in verdict.scores() {
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(format!("{} is outside [0, 1]: {}", name, score));
        }
    }
    Ok(verdict)
}

fn build_prompt(context: &EvaluationContext, tier1: Option<&TraditionalSummary>) -> String {
    let mut prompt = format!("## Candidate\n{}\n", context.candidate());

    let reference = tier1
        .and_then(|s| s.matched_reference)
        .and_then(|i| context.ground_truth().get(i))
        .or_else(|| context.ground_truth().first());
    if let Some(reference) = reference {
        prompt.push_str(&format!("\n## Reference\n{}\n", reference));
    }

    if let Some(summary) = tier1 {
        prompt.push_str("\n## Automatic metrics\n");
        if let Some(similarity) = summary.best_similarity {
            prompt.push_str(&format!("- similarity_to_reference: {:.3}\n", similarity));
        }
        prompt.push_str(&format!(
            "- structural_completeness: {:.3}\n- time_efficiency: {:.3}\n- candidate_tokens: {}\n",
            summary.structural_completeness, summary.time_efficiency, summary.candidate_tokens
        ));
    }
    prompt
}

/// Tier 2. Providers are tried in the configured order and the tier reports
/// `skipped` when none of them produced a verdict.
pub struct LlmJudgePlugin {
    name: String,
    factory: Arc<dyn ProviderFactory>,
}

impl LlmJudgePlugin {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(HttpProviderFactory::default()))
    }

    pub fn with_factory(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            name: PLUGIN_NAME.to_string(),
            factory,
        }
    }

    async fn call(
        provider: &dyn JudgeProvider,
        request: &JudgeRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        match tokio::time::timeout(timeout, provider.judge(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

impl Default for LlmJudgePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EvaluatorPlugin for LlmJudgePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> Tier {
        Tier::Judge
    }

    async fn evaluate(
        &self,
        context: &EvaluationContext,
        upstream: &TierContext,
    ) -> Result<PluginResult, EvaluationError> {
        upstream.validate_for(Tier::Judge)?;

        let settings = &context.settings().judge;
        let tier1 = match upstream {
            TierContext::Traditional(summary) if settings.use_tier1_context => Some(summary),
            _ => None,
        };
        let request = JudgeRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(context, tier1),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        };
        let retry = RetryConfig::from_settings(settings);
        let timeout = Duration::from_millis(settings.request_timeout_ms);

        let mut last_failure: Option<ProviderError> = None;
        for provider in self.factory.build(settings) {
            if let Err(e) = provider.check_availability().await {
                debug!(
                    run_id = %context.run_id(),
                    provider = provider.name(),
                    error = %e,
                    "Judge provider unavailable"
                );
                continue;
            }

            let operation = format!("judge:{}", provider.name());
            let outcome = with_retry(&retry, &operation, || {
                Self::call(provider.as_ref(), &request, timeout)
            })
            .await;

            let raw = match outcome {
                Ok(raw) => raw,
                Err(e) if e.is_unavailable() => {
                    warn!(
                        run_id = %context.run_id(),
                        provider = provider.name(),
                        error = %e,
                        "Judge provider rejected the request, trying next"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        run_id = %context.run_id(),
                        provider = provider.name(),
                        error = %e,
                        "Judge provider failed"
                    );
                    last_failure = Some(e);
                    continue;
                }
            };

            let verdict = match parse_verdict(&raw) {
                Ok(verdict) => verdict,
                Err(reason) => {
                    warn!(
                        run_id = %context.run_id(),
                        provider = provider.name(),
                        reason = %reason,
                        "Judge response could not be parsed"
                    );
                    return Ok(PluginResult::error(
                        &self.name,
                        Tier::Judge,
                        format!("invalid_judge_response: {}", reason),
                    ));
                }
            };

            info!(
                run_id = %context.run_id(),
                provider = provider.name(),
                model = provider.model(),
                "Judge verdict received"
            );

            let mut result = PluginResult::ok(&self.name, Tier::Judge).with_metadata(
                serde_json::json!({
                    "provider": provider.name(),
                    "model": provider.model(),
                    "rationale": verdict.rationale.as_deref(),
                }),
            );
            for (name, score) in verdict.scores() {
                result = result.with_metric(name, score);
            }
            return Ok(result);
        }

        Ok(match last_failure {
            None => PluginResult::skipped(&self.name, Tier::Judge, "no_provider_available"),
            Some(e) if e.is_transient() => {
                PluginResult::skipped(&self.name, Tier::Judge, "provider_transient_failure")
            }
            Some(e) => PluginResult::error(&self.name, Tier::Judge, e.to_string()),
        })
    }

    fn context_for_next_tier(&self, result: &PluginResult) -> TierContext {
        let field = |key: &str| {
            result
                .metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        match (field("provider"), field("model")) {
            (Some(provider), Some(model)) => TierContext::Judge(JudgeSummary {
                provider,
                model,
                scores: result.metrics.clone(),
                rationale: field("rationale"),
            }),
            _ => TierContext::Empty,
        }
    }
}
