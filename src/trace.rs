use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Delegation,
    ToolCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub source: String,
    pub target: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub latency_ms: u64,
}

impl TraceEvent {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        kind: EventKind,
        timestamp: DateTime<Utc>,
        latency_ms: u64,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
            timestamp,
            latency_ms,
        }
    }

    pub fn is_coordination(&self) -> bool {
        self.kind == EventKind::Delegation
    }
}

/// Ordered interaction record of one upstream agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTrace {
    #[serde(default)]
    pub events: Vec<TraceEvent>,
}

impl ExecutionTrace {
    pub fn new(events: Vec<TraceEvent>) -> Self {
        Self { events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut previous: Option<DateTime<Utc>> = None;
        for (index, event) in self.events.iter().enumerate() {
            if event.source.trim().is_empty() {
                return Err(ValidationError::EmptyActorId {
                    index,
                    field: "source",
                });
            }
            if event.target.trim().is_empty() {
                return Err(ValidationError::EmptyActorId {
                    index,
                    field: "target",
                });
            }
            if let Some(prev) = previous {
                if event.timestamp < prev {
                    return Err(ValidationError::NonMonotonicTimestamps { index });
                }
            }
            previous = Some(event.timestamp);
        }
        Ok(())
    }

    /// Wall-clock span from the first event to the completion of the last one.
    pub fn duration_ms(&self) -> u64 {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => {
                let span = (last.timestamp - first.timestamp).num_milliseconds().max(0) as u64;
                span + last.latency_ms
            }
            _ => 0,
        }
    }

    pub fn actor_ids(&self) -> BTreeSet<&str> {
        self.events
            .iter()
            .flat_map(|e| [e.source.as_str(), e.target.as_str()])
            .collect()
    }

    /// Ids that receive tool calls.
    pub fn tool_ids(&self) -> BTreeSet<&str> {
        self.events
            .iter()
            .filter(|e| e.kind == EventKind::ToolCall)
            .map(|e| e.target.as_str())
            .collect()
    }

    pub fn agent_ids(&self) -> BTreeSet<&str> {
        let tools = self.tool_ids();
        self.actor_ids()
            .into_iter()
            .filter(|id| !tools.contains(id))
            .collect()
    }

    pub fn coordination_events(&self) -> usize {
        self.events.iter().filter(|e| e.is_coordination()).count()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub fn delegation(from: &str, to: &str, secs: i64) -> TraceEvent {
        TraceEvent::new(from, to, EventKind::Delegation, at(secs), 100)
    }

    pub fn tool_call(agent: &str, tool: &str, secs: i64) -> TraceEvent {
        TraceEvent::new(agent, tool, EventKind::ToolCall, at(secs), 200)
    }

    /// Coordinator delegating to three workers, each calling two tools.
    pub fn four_agent_trace() -> ExecutionTrace {
        ExecutionTrace::new(vec![
            delegation("coordinator", "researcher", 0),
            delegation("coordinator", "reviewer", 1),
            delegation("coordinator", "writer", 2),
            tool_call("researcher", "search", 3),
            tool_call("researcher", "fetch", 4),
            tool_call("reviewer", "lint", 5),
            tool_call("reviewer", "search", 6),
            tool_call("writer", "editor", 7),
            tool_call("writer", "fetch", 8),
        ])
    }

    pub fn single_agent_trace() -> ExecutionTrace {
        ExecutionTrace::new(vec![
            tool_call("solo", "search", 0),
            tool_call("solo", "editor", 2),
            tool_call("solo", "search", 4),
        ])
    }
}
