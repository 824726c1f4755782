use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::{EvaluatorPlugin, PluginResult, PluginStatus, Tier};
use crate::context::{EvaluationContext, TierContext};
use crate::error::{ErrorKind, RecoverableError, RegistryError};
use crate::tiers::{GraphMetricsPlugin, LlmJudgePlugin, TraditionalMetricsPlugin};

pub const REASON_DISABLED: &str = "disabled";
pub const REASON_NO_PLUGIN: &str = "no_plugin_registered";
pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_PIPELINE_TIMEOUT: &str = "pipeline_timeout";
pub const REASON_CANCELLED: &str = "cancelled";
pub const REASON_PANICKED: &str = "plugin_panicked";

/// Limits applied while the registry runs one evaluation.
pub struct ExecutionControls {
    pub deadline: Instant,
    pub cancel: watch::Receiver<bool>,
}

impl ExecutionControls {
    pub fn new(deadline: Instant, cancel: watch::Receiver<bool>) -> Self {
        Self { deadline, cancel }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Notified around every tier, including tiers that are skipped outright.
pub trait TierObserver: Send {
    fn on_tier_start(&mut self, tier: Tier);

    fn on_tier_finish(&mut self, tier: Tier, results: &[PluginResult]);
}

/// Observer that ignores every notification.
pub struct NoopObserver;

impl TierObserver for NoopObserver {
    fn on_tier_start(&mut self, _tier: Tier) {}

    fn on_tier_finish(&mut self, _tier: Tier, _results: &[PluginResult]) {}
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub results: Vec<PluginResult>,
    pub errors: Vec<RecoverableError>,
    /// Set when the pipeline deadline or a cancellation cut the run short.
    pub interrupted: Option<ErrorKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    PipelineTimeout,
    Cancelled,
}

impl Interrupt {
    fn reason(&self) -> &'static str {
        match self {
            Interrupt::PipelineTimeout => REASON_PIPELINE_TIMEOUT,
            Interrupt::Cancelled => REASON_CANCELLED,
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Interrupt::PipelineTimeout => ErrorKind::Timeout,
            Interrupt::Cancelled => ErrorKind::Cancelled,
        }
    }
}

enum Outcome {
    Finished(PluginResult),
    TierTimeout,
    Interrupted(Interrupt),
}

pub struct PluginRegistry {
    plugins: RwLock<Vec<Arc<dyn EvaluatorPlugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
        }
    }

    /// Registry holding the three built-in tiers.
    pub fn with_default_plugins() -> Self {
        let plugins: Vec<Arc<dyn EvaluatorPlugin>> = vec![
            Arc::new(TraditionalMetricsPlugin::new()),
            Arc::new(LlmJudgePlugin::new()),
            Arc::new(GraphMetricsPlugin::new()),
        ];
        Self {
            plugins: RwLock::new(plugins),
        }
    }

    pub fn register(&self, plugin: Arc<dyn EvaluatorPlugin>) -> Result<(), RegistryError> {
        let name = plugin.name().to_string();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let tier = plugin.tier();

        let mut plugins = self.plugins.write();
        if plugins.iter().any(|p| p.tier() == tier && p.name() == name) {
            warn!(tier = %tier, plugin = %name, "Rejected duplicate plugin registration");
            return Err(RegistryError::Duplicate { tier, name });
        }
        plugins.push(plugin);
        info!(tier = %tier, plugin = %name, "Registered evaluator plugin");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    /// Plugins sorted by tier, in registration order within a tier.
    pub fn ordered_plugins(&self) -> Vec<Arc<dyn EvaluatorPlugin>> {
        let mut plugins = self.plugins.read().clone();
        plugins.sort_by_key(|p| p.tier());
        plugins
    }

    pub fn plugins_for(&self, tier: Tier) -> Vec<Arc<dyn EvaluatorPlugin>> {
        self.plugins
            .read()
            .iter()
            .filter(|p| p.tier() == tier)
            .cloned()
            .collect()
    }

    /// Runs every tier in order. Never fails: each plugin failure, panic or
    /// timeout is folded into that plugin's result.
    pub async fn execute_all(
        &self,
        context: Arc<EvaluationContext>,
        controls: &ExecutionControls,
        observer: &mut dyn TierObserver,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let mut upstream = TierContext::Initial;
        let settings = context.settings();

        for tier in Tier::ALL {
            observer.on_tier_start(tier);
            let plugins = self.plugins_for(tier);
            let mut tier_results = Vec::with_capacity(plugins.len().max(1));

            if let Some(interrupt) = pending_interrupt(&report) {
                tier_results.extend(skip_all(&plugins, tier, interrupt.reason()));
            } else if !settings.enabled_tiers.is_enabled(tier) {
                debug!(run_id = %context.run_id(), tier = %tier, "Tier disabled");
                tier_results.extend(skip_all(&plugins, tier, REASON_DISABLED));
            } else if plugins.is_empty() {
                tier_results.push(PluginResult::skipped(tier.to_string(), tier, REASON_NO_PLUGIN));
            } else {
                let tier_deadline =
                    (Instant::now() + settings.tier_timeout(tier)).min(controls.deadline);
                for plugin in &plugins {
                    if let Some(interrupt) = pending_interrupt(&report) {
                        tier_results.push(PluginResult::skipped(
                            plugin.name(),
                            tier,
                            interrupt.reason(),
                        ));
                        continue;
                    }
                    let result = self
                        .run_plugin(plugin, &context, &upstream, tier_deadline, controls, &mut report)
                        .await;
                    tier_results.push(result);
                }
            }

            if let Some(next) = tier_results
                .iter()
                .zip(plugins.iter())
                .filter(|(r, _)| r.is_ok())
                .last()
                .map(|(r, p)| p.context_for_next_tier(r))
            {
                upstream = next;
            }

            for result in &tier_results {
                if let Some(kind) = reported_error_kind(result) {
                    report.errors.push(RecoverableError {
                        tier,
                        plugin: Some(result.plugin.clone()),
                        kind,
                        message: result.reason.clone().unwrap_or_default(),
                    });
                }
            }

            observer.on_tier_finish(tier, &tier_results);
            report.results.extend(tier_results);
        }

        report
    }

    async fn run_plugin(
        &self,
        plugin: &Arc<dyn EvaluatorPlugin>,
        context: &Arc<EvaluationContext>,
        upstream: &TierContext,
        tier_deadline: Instant,
        controls: &ExecutionControls,
        report: &mut ExecutionReport,
    ) -> PluginResult {
        let tier = plugin.tier();
        let name = plugin.name().to_string();
        let run_id = context.run_id().to_string();

        if controls.is_cancelled() {
            return self.interrupt(report, tier, &name, Interrupt::Cancelled);
        }
        if Instant::now() >= controls.deadline {
            return self.interrupt(report, tier, &name, Interrupt::PipelineTimeout);
        }

        let started = StdInstant::now();
        let task_plugin = Arc::clone(plugin);
        let task_context = Arc::clone(context);
        let task_upstream = upstream.clone();
        // The task is also aborted when this future is dropped mid-tier.
        let mut handle = AbortOnDropHandle::new(tokio::spawn(async move {
            task_plugin.evaluate(&task_context, &task_upstream).await
        }));

        let mut cancel = controls.cancel.clone();
        let outcome = tokio::select! {
            joined = &mut handle => Outcome::Finished(match joined {
                Ok(Ok(mut result)) => {
                    // The plugin does not get to pick its own identity.
                    result.plugin = name.clone();
                    result.tier = tier;
                    match result.out_of_range_metric() {
                        Some((metric, value)) => PluginResult::error(
                            &name,
                            tier,
                            format!("metric {} out of range: {}", metric, value),
                        ),
                        None => result,
                    }
                }
                Ok(Err(e)) => PluginResult::error(&name, tier, e.to_string()),
                Err(join_err) => {
                    error!(
                        run_id = %run_id,
                        tier = %tier,
                        plugin = %name,
                        error = %join_err,
                        "Plugin task panicked"
                    );
                    PluginResult::error(&name, tier, REASON_PANICKED)
                }
            }),
            _ = tokio::time::sleep_until(tier_deadline) => {
                handle.abort();
                if tier_deadline >= controls.deadline {
                    Outcome::Interrupted(Interrupt::PipelineTimeout)
                } else {
                    Outcome::TierTimeout
                }
            }
            _ = cancelled(&mut cancel) => {
                handle.abort();
                Outcome::Interrupted(Interrupt::Cancelled)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut result = match outcome {
            Outcome::Finished(result) => result,
            Outcome::TierTimeout => {
                warn!(
                    run_id = %run_id,
                    tier = %tier,
                    plugin = %name,
                    elapsed_ms = elapsed_ms,
                    "Plugin exceeded tier timeout"
                );
                report.errors.push(RecoverableError {
                    tier,
                    plugin: Some(name.clone()),
                    kind: ErrorKind::Timeout,
                    message: format!("tier timeout exceeded after {}ms", elapsed_ms),
                });
                PluginResult::skipped(&name, tier, REASON_TIMEOUT)
            }
            Outcome::Interrupted(interrupt) => self.interrupt(report, tier, &name, interrupt),
        };
        result.duration_ms = elapsed_ms;

        debug!(
            run_id = %run_id,
            tier = %tier,
            plugin = %name,
            status = ?result.status,
            duration_ms = elapsed_ms,
            "Plugin finished"
        );
        result
    }

    fn interrupt(
        &self,
        report: &mut ExecutionReport,
        tier: Tier,
        plugin: &str,
        interrupt: Interrupt,
    ) -> PluginResult {
        if report.interrupted.is_none() {
            warn!(tier = %tier, plugin = %plugin, reason = interrupt.reason(), "Pipeline interrupted");
            report.interrupted = Some(interrupt.kind());
            report.errors.push(RecoverableError {
                tier,
                plugin: Some(plugin.to_string()),
                kind: interrupt.kind(),
                message: interrupt.reason().to_string(),
            });
        }
        PluginResult::skipped(plugin, tier, interrupt.reason())
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn pending_interrupt(report: &ExecutionReport) -> Option<Interrupt> {
    match report.interrupted {
        Some(ErrorKind::Cancelled) => Some(Interrupt::Cancelled),
        Some(_) => Some(Interrupt::PipelineTimeout),
        None => None,
    }
}

fn skip_all(plugins: &[Arc<dyn EvaluatorPlugin>], tier: Tier, reason: &str) -> Vec<PluginResult> {
    if plugins.is_empty() {
        return vec![PluginResult::skipped(tier.to_string(), tier, reason)];
    }
    plugins
        .iter()
        .map(|p| PluginResult::skipped(p.name(), tier, reason))
        .collect()
}

/// Recoverable error implied by a status the plugin reported itself.
fn reported_error_kind(result: &PluginResult) -> Option<ErrorKind> {
    match (result.status, result.reason.as_deref()) {
        (PluginStatus::Error, _) => Some(ErrorKind::PluginExecution),
        (PluginStatus::Skipped, Some("no_provider_available" | "provider_transient_failure")) => {
            Some(ErrorKind::ProviderUnavailable)
        }
        _ => None,
    }
}

/// Resolves once the flag flips to `true`. Pends forever if the sender is
/// dropped without cancelling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
