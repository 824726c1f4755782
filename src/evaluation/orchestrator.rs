use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::progress::{EvaluationProgress, IllegalTransition, PipelineState};
use super::registry::{ExecutionControls, PluginRegistry, TierObserver, REASON_NO_PLUGIN};
use super::scorer::{self, CompositeResult, RemovalReason, SkippedTier};
use super::{PluginResult, PluginStatus, Tier};
use crate::context::{Artifact, EvaluationContext};
use crate::error::{EngineError, ErrorKind, RecoverableError, ValidationError};
use crate::metrics::Metrics;
use crate::settings::Settings;
use crate::store::{TraceEntry, TraceStore};
use crate::trace::ExecutionTrace;

/// One unit of work for [`Orchestrator::evaluate_batch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub artifact: Artifact,
    #[serde(default)]
    pub trace: ExecutionTrace,
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<PluginRegistry>,
    store: Arc<TraceStore>,
    metrics: Arc<Metrics>,
    max_concurrent: usize,
}

impl Orchestrator {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            store: Arc::new(TraceStore::new()),
            metrics: Metrics::new(),
            max_concurrent: 4,
        }
    }

    pub fn with_store(mut self, store: Arc<TraceStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn evaluate(
        &self,
        artifact: Artifact,
        trace: ExecutionTrace,
        settings: Arc<Settings>,
    ) -> Result<CompositeResult, EngineError> {
        // Dropping the sender leaves the receiver permanently un-cancelled.
        let (_, cancel) = watch::channel(false);
        self.evaluate_with_cancel(artifact, trace, settings, cancel)
            .await
    }

    /// Like [`evaluate`](Self::evaluate), but stops the running tier as soon
    /// as `true` is sent on the channel and returns a partial result.
    pub async fn evaluate_with_cancel(
        &self,
        artifact: Artifact,
        trace: ExecutionTrace,
        settings: Arc<Settings>,
        cancel: watch::Receiver<bool>,
    ) -> Result<CompositeResult, EngineError> {
        let start = Instant::now();
        let run_id = artifact
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        info!(
            run_id = %run_id,
            events = trace.len(),
            references = artifact.ground_truth.len(),
            "Starting evaluation"
        );
        self.metrics.start_evaluation();

        let mut progress = EvaluationProgress::new(&run_id);
        let result = self
            .run(&run_id, artifact, trace, settings, cancel, &mut progress, start)
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(composite) => {
                self.metrics
                    .finish_evaluation(true, composite.is_partial(), elapsed_ms);
                info!(
                    run_id = %run_id,
                    overall_score = %composite.overall_score,
                    recommendation = %composite.recommendation,
                    skipped_tiers = composite.skipped_tiers.len(),
                    duration_ms = %elapsed_ms,
                    "Evaluation completed"
                );
            }
            Err(e) => {
                self.metrics.finish_evaluation(false, false, elapsed_ms);
                error!(
                    run_id = %run_id,
                    error = %e,
                    duration_ms = %elapsed_ms,
                    "Evaluation failed"
                );
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        run_id: &str,
        artifact: Artifact,
        trace: ExecutionTrace,
        settings: Arc<Settings>,
        cancel: watch::Receiver<bool>,
        progress: &mut EvaluationProgress,
        start: Instant,
    ) -> Result<CompositeResult, EngineError> {
        if self.store.contains(run_id) {
            advance(run_id, progress.fail());
            return Err(ValidationError::DuplicateRunId(run_id.to_string()).into());
        }

        let context = match EvaluationContext::new(run_id, artifact, trace, settings) {
            Ok(context) => Arc::new(context),
            Err(e) => {
                advance(run_id, progress.fail());
                return Err(e.into());
            }
        };
        let settings = context.settings();

        let deadline = tokio::time::Instant::now() + settings.pipeline_timeout();
        let controls = ExecutionControls::new(deadline, cancel);
        let mut observer = ProgressObserver {
            run_id,
            progress: &mut *progress,
            metrics: &self.metrics,
        };
        let report = self
            .registry
            .execute_all(Arc::clone(&context), &controls, &mut observer)
            .await;

        advance(run_id, progress.transition_to(PipelineState::Scoring));
        let outcome = match scorer::score(&report.results, settings) {
            Ok(outcome) => outcome,
            Err(e) => {
                advance(run_id, progress.fail());
                return Err(e.into());
            }
        };

        let mut errors = report.errors;
        errors.extend(outcome.removed.iter().filter_map(|removed| {
            let detail = match &removed.reason {
                RemovalReason::Missing => "not reported".to_string(),
                RemovalReason::ErrorMarked(message) => message.clone(),
                RemovalReason::TierInactive | RemovalReason::SingleAgentMode => return None,
            };
            Some(RecoverableError {
                tier: removed.tier,
                plugin: None,
                kind: ErrorKind::MissingMetric,
                message: format!("{}: {}", removed.metric, detail),
            })
        }));

        if let Some(kind) = report.interrupted {
            warn!(run_id = %run_id, kind = %kind, "Returning partial result");
        }

        let mut states = progress.history();
        states.push(PipelineState::Done);
        let created_at = Utc::now();
        let composite = CompositeResult {
            run_id: run_id.to_string(),
            overall_score: outcome.overall_score,
            recommendation: settings.recommend(outcome.overall_score),
            per_tier_scores: outcome.per_tier_scores,
            breakdown: outcome.breakdown,
            weights_used: outcome.weights_used,
            single_agent_mode: outcome.single_agent_mode,
            skipped_tiers: skipped_tiers(&report.results),
            errors,
            plugin_results: report.results,
            states,
            duration_ms: start.elapsed().as_millis() as u64,
            created_at,
        };

        // Done is only entered once the entry is stored.
        if let Err(e) = self.store.append(TraceEntry {
            run_id: run_id.to_string(),
            context: context.summary(),
            result: composite.clone(),
            created_at,
        }) {
            advance(run_id, progress.fail());
            return Err(e.into());
        }
        advance(run_id, progress.complete());
        Ok(composite)
    }

    /// Runs the requests concurrently, at most `max_concurrent` at a time.
    /// Results come back in request order.
    pub async fn evaluate_batch(
        &self,
        requests: Vec<EvaluationRequest>,
        settings: Arc<Settings>,
    ) -> Vec<Result<CompositeResult, EngineError>> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(requests.len());

        for request in requests {
            let orchestrator = self.clone();
            let sem = Arc::clone(&semaphore);
            let settings = Arc::clone(&settings);

            let handle = tokio::spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|_| EngineError::Internal("Semaphore closed".to_string()))?;
                orchestrator
                    .evaluate(request.artifact, request.trace, settings)
                    .await
            });
            handles.push(handle);
        }

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(EngineError::Internal(format!("Task panicked: {}", e))),
            })
            .collect()
    }
}

/// Drives the state machine from registry notifications.
struct ProgressObserver<'a> {
    run_id: &'a str,
    progress: &'a mut EvaluationProgress,
    metrics: &'a Metrics,
}

impl TierObserver for ProgressObserver<'_> {
    fn on_tier_start(&mut self, tier: Tier) {
        advance(self.run_id, self.progress.begin_tier(tier));
    }

    fn on_tier_finish(&mut self, tier: Tier, results: &[PluginResult]) {
        let skipped = !results.iter().any(|r| r.is_ok());
        if skipped {
            self.metrics.record_tier_skip(tier);
        }
        for _ in results.iter().filter(|r| r.status == PluginStatus::Error) {
            self.metrics.record_plugin_error();
        }
        advance(self.run_id, self.progress.finish_tier(tier, skipped));
    }
}

/// Transitions are driven internally, so a rejection is a bug worth logging
/// but not worth failing the evaluation over.
fn advance(run_id: &str, outcome: Result<(), IllegalTransition>) {
    if let Err(e) = outcome {
        error!(run_id = %run_id, error = %e, "Pipeline state machine rejected transition");
    }
}

/// Tiers without any successful plugin, with the reason each plugin gave.
fn skipped_tiers(results: &[PluginResult]) -> Vec<SkippedTier> {
    let mut skipped = Vec::new();
    for tier in Tier::ALL {
        let tier_results: Vec<&PluginResult> = results.iter().filter(|r| r.tier == tier).collect();
        if tier_results.iter().any(|r| r.is_ok()) {
            continue;
        }
        for result in tier_results {
            let reason = result
                .reason
                .clone()
                .unwrap_or_else(|| format!("{:?}", result.status).to_lowercase());
            let plugin = (reason != REASON_NO_PLUGIN).then(|| result.plugin.clone());
            skipped.push(SkippedTier {
                tier,
                plugin,
                reason,
            });
        }
    }
    skipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TierContext;
    use crate::error::{EvaluationError, ScoringError};
    use crate::evaluation::EvaluatorPlugin;
    use crate::settings::PipelineBudget;
    use crate::store::fixtures::entry;
    use crate::tiers::{metric, GraphMetricsPlugin, LlmJudgePlugin, TraditionalMetricsPlugin};
    use crate::trace::fixtures::{four_agent_trace, single_agent_trace};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StaticJudge {
        delay_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl EvaluatorPlugin for StaticJudge {
        fn name(&self) -> &str {
            "static_judge"
        }

        fn tier(&self) -> Tier {
            Tier::Judge
        }

        async fn evaluate(
            &self,
            _context: &EvaluationContext,
            _upstream: &TierContext,
        ) -> Result<PluginResult, EvaluationError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(EvaluationError::Internal("judge exploded".to_string()));
            }
            Ok(PluginResult::ok("static_judge", Tier::Judge)
                .with_metric(metric::TECHNICAL_ACCURACY, 0.9)
                .with_metric(metric::CONSTRUCTIVENESS, 0.8)
                .with_metric(metric::PLANNING_RATIONALITY, 0.7))
        }

        fn context_for_next_tier(&self, _result: &PluginResult) -> TierContext {
            TierContext::Empty
        }
    }

    /// Writes an entry under the run id being evaluated, as a concurrent
    /// writer would.
    struct ConflictingWriter {
        store: Arc<TraceStore>,
    }

    #[async_trait]
    impl EvaluatorPlugin for ConflictingWriter {
        fn name(&self) -> &str {
            "conflicting_writer"
        }

        fn tier(&self) -> Tier {
            Tier::Judge
        }

        async fn evaluate(
            &self,
            context: &EvaluationContext,
            _upstream: &TierContext,
        ) -> Result<PluginResult, EvaluationError> {
            self.store
                .append(entry(context.run_id(), 0.5))
                .map_err(|e| EvaluationError::Internal(e.to_string()))?;
            Ok(PluginResult::ok("conflicting_writer", Tier::Judge)
                .with_metric(metric::TECHNICAL_ACCURACY, 0.9)
                .with_metric(metric::CONSTRUCTIVENESS, 0.8)
                .with_metric(metric::PLANNING_RATIONALITY, 0.7))
        }

        fn context_for_next_tier(&self, _result: &PluginResult) -> TierContext {
            TierContext::Empty
        }
    }

    fn orchestrator(judge: Arc<dyn EvaluatorPlugin>) -> Orchestrator {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(TraditionalMetricsPlugin::new()))
            .unwrap();
        registry.register(judge).unwrap();
        registry.register(Arc::new(GraphMetricsPlugin::new())).unwrap();
        Orchestrator::new(Arc::new(registry))
    }

    /// The real HTTP judge with no credentials available for any provider.
    fn unavailable_judge() -> Arc<dyn EvaluatorPlugin> {
        Arc::new(LlmJudgePlugin::new())
    }

    /// Default settings with every provider pointed at an unset key variable.
    fn offline_settings() -> Settings {
        let mut settings = Settings::default();
        for (i, provider) in settings.judge.providers.iter_mut().enumerate() {
            provider.api_key_env = format!("AGENT_JUDGE_TEST_ORCH_NO_KEY_{}", i);
        }
        settings
    }

    fn artifact(run_id: &str) -> Artifact {
        Artifact::new("Cache the lookups and invalidate on write.")
            .with_reference("Cache lookups, invalidate on every write.")
            .with_run_id(run_id)
    }

    fn assert_normalized(result: &CompositeResult) {
        let sum: f64 = result.weights_used.values().sum();
        assert!((sum - 1.0).abs() <= 0.01, "weights sum to {}", sum);
    }

    #[test]
    fn test_orchestrator_with_config() {
        let orch = orchestrator(unavailable_judge()).with_max_concurrent(8);
        assert_eq!(orch.max_concurrent, 8);
        assert_eq!(orch.registry().len(), 3);
        assert!(orch.store().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_judge_redistributes_weight() {
        let settings = offline_settings();
        assert_eq!(settings.judge.providers.len(), 2);
        let orch = orchestrator(unavailable_judge());
        let result = orch
            .evaluate(artifact("run-1"), four_agent_trace(), Arc::new(settings))
            .await
            .unwrap();

        assert_normalized(&result);
        for name in metric::JUDGE_METRICS {
            assert!(!result.weights_used.contains_key(name));
        }
        assert!(result.tier_skipped(Tier::Judge));
        assert_eq!(result.skipped_tiers[0].reason, "no_provider_available");
        assert!(result
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::ProviderUnavailable));
        assert!(result.states.contains(&PipelineState::Tier2Skipped));
        assert_eq!(result.states.last(), Some(&PipelineState::Done));
        assert!(!result.single_agent_mode);
        assert!(orch.store().get("run-1").is_some());
    }

    #[tokio::test]
    async fn test_all_tiers_contribute() {
        let orch = orchestrator(Arc::new(StaticJudge {
            delay_ms: 0,
            fail: false,
        }));
        let result = orch
            .evaluate(artifact("run-2"), four_agent_trace(), Arc::new(offline_settings()))
            .await
            .unwrap();

        assert!(result.skipped_tiers.is_empty());
        assert_eq!(result.per_tier_scores.len(), 3);
        assert_eq!(result.weights_used.len(), 10);
        assert!((0.0..=1.0).contains(&result.overall_score));
        assert_eq!(result.recommendation, offline_settings().recommend(result.overall_score));
    }

    #[tokio::test]
    async fn test_single_agent_trace_drops_coordination_quality() {
        let orch = orchestrator(unavailable_judge());
        let result = orch
            .evaluate(artifact("run-3"), single_agent_trace(), Arc::new(offline_settings()))
            .await
            .unwrap();

        assert!(result.single_agent_mode);
        assert!(!result.weights_used.contains_key(metric::COORDINATION_QUALITY));
        assert_normalized(&result);
    }

    #[tokio::test]
    async fn test_judge_failure_is_recoverable() {
        let orch = orchestrator(Arc::new(StaticJudge {
            delay_ms: 0,
            fail: true,
        }));
        let result = orch
            .evaluate(artifact("run-4"), four_agent_trace(), Arc::new(offline_settings()))
            .await
            .unwrap();

        assert!(result.tier_skipped(Tier::Judge));
        assert!(result
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::PluginExecution && e.tier == Tier::Judge));
        assert_eq!(orch.metrics().tier_skip_count(Tier::Judge), 1);
    }

    #[tokio::test]
    async fn test_invalid_input_fails_fast() {
        let orch = orchestrator(unavailable_judge());
        let err = orch
            .evaluate(Artifact::new("  "), four_agent_trace(), Arc::new(offline_settings()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::InputValidation(ValidationError::EmptyCandidate)
        ));
        assert!(orch.store().is_empty());
        assert_eq!(
            orch.metrics()
                .evaluations_failed
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_run_id_rejected() {
        let orch = orchestrator(unavailable_judge());
        let settings = Arc::new(offline_settings());
        orch.evaluate(artifact("dup"), four_agent_trace(), Arc::clone(&settings))
            .await
            .unwrap();
        let err = orch
            .evaluate(artifact("dup"), four_agent_trace(), settings)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InputValidation(ValidationError::DuplicateRunId(_))
        ));
        assert_eq!(orch.store().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_score_is_fatal() {
        let mut settings = offline_settings();
        settings.enabled_tiers.tier1 = false;
        settings.enabled_tiers.tier3 = false;
        let orch = orchestrator(unavailable_judge());
        let err = orch
            .evaluate(artifact("run-5"), four_agent_trace(), Arc::new(settings))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CompositeScoring(ScoringError::NoActiveMetrics)
        ));
        assert!(orch.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_timeout_returns_partial_result() {
        let mut settings = offline_settings();
        settings.timeouts.pipeline = PipelineBudget::Fixed { ms: 200 };
        let orch = orchestrator(Arc::new(StaticJudge {
            delay_ms: 60_000,
            fail: false,
        }));
        let result = orch
            .evaluate(artifact("run-6"), four_agent_trace(), Arc::new(settings))
            .await
            .unwrap();

        assert!(result.per_tier_scores.contains_key(&Tier::Traditional));
        let reasons: Vec<&str> = result
            .skipped_tiers
            .iter()
            .map(|s| s.reason.as_str())
            .collect();
        assert_eq!(reasons, vec!["pipeline_timeout", "pipeline_timeout"]);
        assert_normalized(&result);
        assert!(result.errors.iter().any(|e| e.kind == ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_returns_partial_result() {
        let orch = orchestrator(Arc::new(StaticJudge {
            delay_ms: 60_000,
            fail: false,
        }));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });
        let result = orch
            .evaluate_with_cancel(
                artifact("run-7"),
                four_agent_trace(),
                Arc::new(offline_settings()),
                rx,
            )
            .await
            .unwrap();

        assert!(result.tier_skipped(Tier::Judge));
        assert!(result.tier_skipped(Tier::Graph));
        assert!(result
            .skipped_tiers
            .iter()
            .all(|s| s.reason == "cancelled"));
        assert!(result.errors.iter().any(|e| e.kind == ErrorKind::Cancelled));
        assert_eq!(result.states.last(), Some(&PipelineState::Done));
    }

    #[tokio::test]
    async fn test_generated_run_id() {
        let orch = orchestrator(unavailable_judge());
        let result = orch
            .evaluate(
                Artifact::new("some output"),
                four_agent_trace(),
                Arc::new(offline_settings()),
            )
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(&result.run_id).is_ok());
    }

    #[tokio::test]
    async fn test_evaluate_batch() {
        let orch = orchestrator(unavailable_judge()).with_max_concurrent(2);
        let requests = (0..5)
            .map(|i| EvaluationRequest {
                artifact: artifact(&format!("batch-{}", i)),
                trace: four_agent_trace(),
            })
            .collect();

        let results = orch
            .evaluate_batch(requests, Arc::new(offline_settings()))
            .await;

        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.as_ref().unwrap().run_id, format!("batch-{}", i));
        }
        assert_eq!(orch.store().len(), 5);
        assert_eq!(orch.store().list().len(), 5);
    }

    #[tokio::test]
    async fn test_batch_reports_failures_individually() {
        let orch = orchestrator(unavailable_judge());
        let requests = vec![
            EvaluationRequest {
                artifact: artifact("ok"),
                trace: four_agent_trace(),
            },
            EvaluationRequest {
                artifact: Artifact::new(""),
                trace: four_agent_trace(),
            },
        ];
        let results = orch
            .evaluate_batch(requests, Arc::new(offline_settings()))
            .await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn test_store_conflict_fails_instead_of_done() {
        let store = Arc::new(TraceStore::new());
        let orch = orchestrator(Arc::new(ConflictingWriter {
            store: Arc::clone(&store),
        }))
        .with_store(Arc::clone(&store));

        let mut progress = EvaluationProgress::new("raced");
        let result = orch
            .run(
                "raced",
                artifact("raced"),
                four_agent_trace(),
                Arc::new(offline_settings()),
                watch::channel(false).1,
                &mut progress,
                Instant::now(),
            )
            .await;

        assert!(matches!(result, Err(EngineError::Store(_))));
        assert_eq!(progress.state(), PipelineState::Failed);
        assert!(!progress.history().contains(&PipelineState::Done));
        assert_eq!(store.get("raced").map(|e| e.result.overall_score), Some(0.5));
    }
}
