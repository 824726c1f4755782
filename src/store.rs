use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::ContextSummary;
use crate::error::StoreError;
use crate::evaluation::CompositeResult;

/// One completed evaluation. Never modified after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    pub run_id: String,
    pub context: ContextSummary,
    pub result: CompositeResult,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntrySummary {
    pub run_id: String,
    pub overall_score: f64,
    pub recommendation: String,
    pub single_agent_mode: bool,
    pub skipped_tiers: usize,
    pub created_at: DateTime<Utc>,
}

/// Append-only evaluation history keyed by run id.
pub struct TraceStore {
    entries: DashMap<String, Arc<TraceEntry>>,
}

impl TraceStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn append(&self, entry: TraceEntry) -> Result<Arc<TraceEntry>, StoreError> {
        match self.entries.entry(entry.run_id.clone()) {
            Entry::Occupied(_) => {
                warn!(run_id = %entry.run_id, "Rejected duplicate trace entry");
                Err(StoreError::DuplicateRun(entry.run_id))
            }
            Entry::Vacant(slot) => {
                let entry = Arc::new(entry);
                slot.insert(Arc::clone(&entry));
                debug!(run_id = %entry.run_id, "Appended trace entry");
                Ok(entry)
            }
        }
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<TraceEntry>> {
        self.entries.get(run_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.entries.contains_key(run_id)
    }

    /// Summaries of every entry, oldest first.
    pub fn list(&self) -> Vec<EntrySummary> {
        let mut summaries: Vec<EntrySummary> = self
            .entries
            .iter()
            .map(|e| {
                let entry = e.value();
                EntrySummary {
                    run_id: entry.run_id.clone(),
                    overall_score: entry.result.overall_score,
                    recommendation: entry.result.recommendation.clone(),
                    single_agent_mode: entry.result.single_agent_mode,
                    skipped_tiers: entry.result.skipped_tiers.len(),
                    created_at: entry.created_at,
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        summaries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::collections::BTreeMap;

    pub fn entry(run_id: &str, score: f64) -> TraceEntry {
        let now = Utc::now();
        TraceEntry {
            run_id: run_id.to_string(),
            context: ContextSummary {
                candidate_sha256: "00".repeat(32),
                candidate_chars: 10,
                reference_count: 1,
                event_count: 3,
                actor_count: 2,
                trace_duration_ms: 1500,
            },
            result: CompositeResult {
                run_id: run_id.to_string(),
                overall_score: score,
                recommendation: "accept".to_string(),
                per_tier_scores: BTreeMap::new(),
                breakdown: BTreeMap::new(),
                weights_used: BTreeMap::new(),
                single_agent_mode: false,
                skipped_tiers: Vec::new(),
                errors: Vec::new(),
                plugin_results: Vec::new(),
                states: Vec::new(),
                duration_ms: 12,
                created_at: now,
            },
            created_at: now,
        }
    }
}
