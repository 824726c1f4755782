pub mod orchestrator;
pub mod plugin;
pub mod progress;
pub mod registry;
pub mod scorer;

pub use orchestrator::{EvaluationRequest, Orchestrator};
pub use plugin::{EvaluatorPlugin, PluginResult, PluginStatus, Tier};
pub use progress::{EvaluationProgress, PipelineState};
pub use registry::{ExecutionControls, NoopObserver, PluginRegistry, TierObserver};
pub use scorer::{CompositeResult, MetricContribution, SkippedTier};
