use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::context::{EvaluationContext, TierContext};
use crate::error::EvaluationError;

/// Evaluation stage. Tiers always run in ascending order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    #[serde(rename = "tier1")]
    Traditional = 1,
    #[serde(rename = "tier2")]
    Judge = 2,
    #[serde(rename = "tier3")]
    Graph = 3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Traditional, Tier::Judge, Tier::Graph];

    pub fn number(&self) -> u8 {
        *self as u8
    }

    pub fn from_number(n: u8) -> Option<Tier> {
        match n {
            1 => Some(Tier::Traditional),
            2 => Some(Tier::Judge),
            3 => Some(Tier::Graph),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Ok,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginResult {
    pub plugin: String,
    pub tier: Tier,
    pub status: PluginStatus,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Metrics the plugin could not compute, with the reason.
    #[serde(default)]
    pub metric_errors: BTreeMap<String, String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub single_agent_mode: Option<bool>,
    /// Auxiliary plugin output that is not a score.
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub duration_ms: u64,
}

impl PluginResult {
    pub fn ok(plugin: impl Into<String>, tier: Tier) -> Self {
        Self {
            plugin: plugin.into(),
            tier,
            status: PluginStatus::Ok,
            metrics: BTreeMap::new(),
            metric_errors: BTreeMap::new(),
            reason: None,
            single_agent_mode: None,
            metadata: serde_json::Value::Null,
            duration_ms: 0,
        }
    }

    pub fn skipped(plugin: impl Into<String>, tier: Tier, reason: impl Into<String>) -> Self {
        Self {
            status: PluginStatus::Skipped,
            reason: Some(reason.into()),
            ..Self::ok(plugin, tier)
        }
    }

    pub fn error(plugin: impl Into<String>, tier: Tier, reason: impl Into<String>) -> Self {
        Self {
            status: PluginStatus::Error,
            reason: Some(reason.into()),
            ..Self::ok(plugin, tier)
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, score: f64) -> Self {
        self.metrics.insert(name.into(), score);
        self
    }

    pub fn with_metric_error(mut self, name: impl Into<String>, reason: impl Into<String>) -> Self {
        self.metric_errors.insert(name.into(), reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == PluginStatus::Ok
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// First metric whose score is NaN, infinite or outside `[0, 1]`.
    pub fn out_of_range_metric(&self) -> Option<(&str, f64)> {
        self.metrics
            .iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0 || **v > 1.0)
            .map(|(k, v)| (k.as_str(), *v))
    }
}

/// Contract every evaluation stage implements.
///
/// `evaluate` returns `Err` only when its input is malformed. Expected runtime
/// conditions (an unreachable provider, a trace without tool calls) are
/// reported through the result status instead.
#[async_trait]
pub trait EvaluatorPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> Tier;

    async fn evaluate(
        &self,
        context: &EvaluationContext,
        upstream: &TierContext,
    ) -> Result<PluginResult, EvaluationError>;

    fn context_for_next_tier(&self, result: &PluginResult) -> TierContext;
}
