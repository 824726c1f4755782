use async_trait::async_trait;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::metric;
use crate::context::{EvaluationContext, TierContext};
use crate::error::EvaluationError;
use crate::evaluation::{EvaluatorPlugin, PluginResult, Tier};
use crate::trace::{EventKind, ExecutionTrace};

pub const PLUGIN_NAME: &str = "graph_metrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKind {
    Agent,
    Tool,
}

#[derive(Debug, Clone)]
pub struct ActorNode {
    pub id: String,
    pub kind: ActorKind,
}

#[derive(Debug, Clone, Copy)]
pub struct Interaction {
    pub kind: EventKind,
    pub latency_ms: u64,
}

/// Directed multigraph of actors and the interactions between them.
pub struct InteractionGraph {
    graph: DiGraph<ActorNode, Interaction>,
    index: BTreeMap<String, NodeIndex>,
    /// Distinct (source, target, kind) triples.
    distinct_interactions: usize,
}

impl InteractionGraph {
    pub fn from_trace(trace: &ExecutionTrace) -> Self {
        let tools = trace.tool_ids();
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();

        for id in trace.actor_ids() {
            let kind = if tools.contains(id) {
                ActorKind::Tool
            } else {
                ActorKind::Agent
            };
            let node = graph.add_node(ActorNode {
                id: id.to_string(),
                kind,
            });
            index.insert(id.to_string(), node);
        }

        let mut seen = BTreeSet::new();
        for event in &trace.events {
            let (Some(&from), Some(&to)) = (index.get(&event.source), index.get(&event.target))
            else {
                continue;
            };
            graph.add_edge(
                from,
                to,
                Interaction {
                    kind: event.kind,
                    latency_ms: event.latency_ms,
                },
            );
            seen.insert((from, to, event.kind));
        }

        Self {
            graph,
            index,
            distinct_interactions: seen.len(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn agents(&self) -> Vec<NodeIndex> {
        self.index
            .values()
            .copied()
            .filter(|n| self.graph[*n].kind == ActorKind::Agent)
            .collect()
    }

    pub fn delegation_count(&self) -> usize {
        self.graph
            .edge_weights()
            .filter(|e| e.kind == EventKind::Delegation)
            .count()
    }

    /// At most one agent and no delegation between agents.
    pub fn is_single_agent(&self) -> bool {
        self.agents().len() <= 1 && self.delegation_count() == 0
    }

    pub fn path_convergence(&self, optimal_steps: Option<usize>) -> f64 {
        let actual = self.edge_count();
        if actual == 0 {
            return 1.0;
        }
        let minimum = optimal_steps.unwrap_or(self.distinct_interactions);
        (minimum as f64 / actual as f64).min(1.0)
    }

    /// `None` when the trace has no tool calls.
    pub fn tool_selection_accuracy(&self, oracle: &dyn ToolOracle) -> Option<f64> {
        let mut total = 0usize;
        let mut appropriate = 0usize;
        for edge in self.graph.edge_references() {
            if edge.weight().kind != EventKind::ToolCall {
                continue;
            }
            total += 1;
            let agent = &self.graph[edge.source()].id;
            let tool = &self.graph[edge.target()].id;
            if oracle.is_appropriate(agent, tool) {
                appropriate += 1;
            }
        }
        (total > 0).then(|| appropriate as f64 / total as f64)
    }

    pub fn communication_overhead(&self) -> f64 {
        let total = self.edge_count();
        if total == 0 {
            return 0.0;
        }
        self.delegation_count() as f64 / total as f64
    }

    /// Highest degree centrality over the agent-to-agent subgraph, counting
    /// distinct neighbours in either direction.
    pub fn coordination_centrality(&self) -> f64 {
        let agents = self.agents();
        if agents.len() < 2 {
            return 0.0;
        }
        let denominator = (agents.len() - 1) as f64;
        agents
            .iter()
            .map(|&node| {
                let neighbours: BTreeSet<NodeIndex> = self
                    .graph
                    .neighbors_directed(node, Direction::Outgoing)
                    .chain(self.graph.neighbors_directed(node, Direction::Incoming))
                    .filter(|n| *n != node && self.graph[*n].kind == ActorKind::Agent)
                    .collect();
                neighbours.len() as f64 / denominator
            })
            .fold(0.0, f64::max)
    }

    /// One minus the coefficient of variation of per-agent event counts.
    pub fn task_distribution_balance(&self) -> f64 {
        let counts: Vec<f64> = self
            .agents()
            .iter()
            .map(|&node| {
                let out = self.graph.edges_directed(node, Direction::Outgoing).count();
                let inc = self.graph.edges_directed(node, Direction::Incoming).count();
                (out + inc) as f64
            })
            .collect();
        if counts.is_empty() {
            return 1.0;
        }
        let mean = counts.iter().sum::<f64>() / counts.len() as f64;
        if mean == 0.0 {
            return 1.0;
        }
        let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
        (1.0 - variance.sqrt() / mean).max(0.0)
    }

    pub fn total_latency_ms(&self) -> u64 {
        self.graph.edge_weights().map(|e| e.latency_ms).sum()
    }
}

/// Decides whether an agent picked an appropriate tool.
pub trait ToolOracle: Send + Sync {
    fn is_appropriate(&self, agent: &str, tool: &str) -> bool;
}

/// Per-agent allow-list. Agents without an entry may call any tool.
#[derive(Debug, Clone, Default)]
pub struct AllowListOracle {
    allowed: BTreeMap<String, BTreeSet<String>>,
}

impl AllowListOracle {
    pub fn new(allowlist: &BTreeMap<String, Vec<String>>) -> Self {
        Self {
            allowed: allowlist
                .iter()
                .map(|(agent, tools)| (agent.clone(), tools.iter().cloned().collect()))
                .collect(),
        }
    }
}

impl ToolOracle for AllowListOracle {
    fn is_appropriate(&self, agent: &str, tool: &str) -> bool {
        self.allowed
            .get(agent)
            .map_or(true, |tools| tools.contains(tool))
    }
}

/// Tier 3: structural metrics over the [`InteractionGraph`] of a trace.
pub struct GraphMetricsPlugin {
    name: String,
    oracle: Option<Arc<dyn ToolOracle>>,
}

impl GraphMetricsPlugin {
    pub fn new() -> Self {
        Self {
            name: PLUGIN_NAME.to_string(),
            oracle: None,
        }
    }

    /// Replaces the allow-list from settings with a custom oracle.
    pub fn with_oracle(mut self, oracle: Arc<dyn ToolOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }
}

impl Default for GraphMetricsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EvaluatorPlugin for GraphMetricsPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> Tier {
        Tier::Graph
    }

    async fn evaluate(
        &self,
        context: &EvaluationContext,
        upstream: &TierContext,
    ) -> Result<PluginResult, EvaluationError> {
        upstream.validate_for(Tier::Graph)?;

        let settings = &context.settings().graph;
        let graph = InteractionGraph::from_trace(context.trace());
        let single_agent = graph.is_single_agent();

        if graph.edge_count() == 0 {
            let mut result = PluginResult::skipped(&self.name, Tier::Graph, "empty_trace");
            result.single_agent_mode = Some(single_agent);
            return Ok(result);
        }

        let default_oracle;
        let oracle: &dyn ToolOracle = match &self.oracle {
            Some(custom) => custom.as_ref(),
            None => {
                default_oracle = AllowListOracle::new(&settings.tool_allowlist);
                &default_oracle
            }
        };

        let convergence = graph.path_convergence(settings.optimal_steps);
        let overhead = graph.communication_overhead();
        let centrality = graph.coordination_centrality();
        let balance = graph.task_distribution_balance();
        let quality = (centrality + (1.0 - overhead) + balance) / 3.0;

        debug!(
            run_id = %context.run_id(),
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            agents = graph.agents().len(),
            single_agent = single_agent,
            "Built interaction graph"
        );

        let mut result = PluginResult::ok(&self.name, Tier::Graph)
            .with_metric(metric::PATH_CONVERGENCE, convergence)
            .with_metric(metric::COMMUNICATION_OVERHEAD, overhead)
            .with_metric(metric::COORDINATION_CENTRALITY, centrality)
            .with_metric(metric::TASK_DISTRIBUTION_BALANCE, balance)
            .with_metric(metric::COORDINATION_QUALITY, quality)
            .with_metadata(serde_json::json!({
                "nodes": graph.node_count(),
                "edges": graph.edge_count(),
                "agents": graph.agents().len(),
                "total_latency_ms": graph.total_latency_ms(),
            }));

        result = match graph.tool_selection_accuracy(oracle) {
            Some(accuracy) => result.with_metric(metric::TOOL_SELECTION_ACCURACY, accuracy),
            None => result.with_metric_error(metric::TOOL_SELECTION_ACCURACY, "no_tool_calls"),
        };
        result.single_agent_mode = Some(single_agent);
        Ok(result)
    }

    fn context_for_next_tier(&self, _result: &PluginResult) -> TierContext {
        TierContext::Empty
    }
}
