pub mod graph;
pub mod judge;
pub mod traditional;

pub use graph::{AllowListOracle, GraphMetricsPlugin, InteractionGraph, ToolOracle};
pub use judge::LlmJudgePlugin;
pub use traditional::TraditionalMetricsPlugin;

/// Metric names shared between plugins, settings and the scorer.
pub mod metric {
    pub const COSINE_SIMILARITY: &str = "cosine_similarity";
    pub const JACCARD_SIMILARITY: &str = "jaccard_similarity";
    pub const STRUCTURAL_COMPLETENESS: &str = "structural_completeness";
    pub const TIME_EFFICIENCY: &str = "time_efficiency";

    pub const TECHNICAL_ACCURACY: &str = "technical_accuracy";
    pub const CONSTRUCTIVENESS: &str = "constructiveness";
    pub const PLANNING_RATIONALITY: &str = "planning_rationality";

    pub const PATH_CONVERGENCE: &str = "path_convergence";
    pub const TOOL_SELECTION_ACCURACY: &str = "tool_selection_accuracy";
    pub const COMMUNICATION_OVERHEAD: &str = "communication_overhead";
    pub const COORDINATION_CENTRALITY: &str = "coordination_centrality";
    pub const TASK_DISTRIBUTION_BALANCE: &str = "task_distribution_balance";
    /// Dropped from the weight pool when the trace shows single-agent mode.
    pub const COORDINATION_QUALITY: &str = "coordination_quality";

    pub const JUDGE_METRICS: [&str; 3] = [TECHNICAL_ACCURACY, CONSTRUCTIVENESS, PLANNING_RATIONALITY];
}
