pub mod config;
pub mod context;
pub mod error;
pub mod evaluation;
pub mod metrics;
pub mod settings;
pub mod store;
pub mod tiers;
pub mod trace;

pub use error::EngineError;
pub use evaluation::{CompositeResult, EvaluationRequest, Orchestrator, PluginRegistry};
pub use settings::Settings;
