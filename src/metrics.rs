use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::evaluation::Tier;

#[derive(Debug)]
pub struct Metrics {
    pub evaluations_total: AtomicU64,
    pub evaluations_active: AtomicU64,
    pub evaluations_completed: AtomicU64,
    pub evaluations_failed: AtomicU64,
    pub evaluations_partial: AtomicU64,
    pub tier_skips: [AtomicU64; 3],
    pub plugin_errors: AtomicU64,
    pub duration_sum_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            evaluations_total: AtomicU64::new(0),
            evaluations_active: AtomicU64::new(0),
            evaluations_completed: AtomicU64::new(0),
            evaluations_failed: AtomicU64::new(0),
            evaluations_partial: AtomicU64::new(0),
            tier_skips: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            plugin_errors: AtomicU64::new(0),
            duration_sum_ms: AtomicU64::new(0),
        })
    }

    pub fn start_evaluation(&self) {
        self.evaluations_total.fetch_add(1, Ordering::Relaxed);
        self.evaluations_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_evaluation(&self, succeeded: bool, partial: bool, duration_ms: u64) {
        self.evaluations_active.fetch_sub(1, Ordering::Relaxed);
        self.duration_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if succeeded {
            self.evaluations_completed.fetch_add(1, Ordering::Relaxed);
            if partial {
                self.evaluations_partial.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.evaluations_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tier_skip(&self, tier: Tier) {
        self.tier_skips[tier.number() as usize - 1].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plugin_error(&self) {
        self.plugin_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tier_skip_count(&self, tier: Tier) -> u64 {
        self.tier_skips[tier.number() as usize - 1].load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let total = self.evaluations_total.load(Ordering::Relaxed);
        let active = self.evaluations_active.load(Ordering::Relaxed);
        let completed = self.evaluations_completed.load(Ordering::Relaxed);
        let failed = self.evaluations_failed.load(Ordering::Relaxed);
        let partial = self.evaluations_partial.load(Ordering::Relaxed);
        let plugin_errors = self.plugin_errors.load(Ordering::Relaxed);
        let dur_sum = self.duration_sum_ms.load(Ordering::Relaxed);

        let mut out = format!(
            "# HELP agent_judge_evaluations_total Total evaluations started.\n\
             # TYPE agent_judge_evaluations_total counter\n\
             agent_judge_evaluations_total {}\n\
             # HELP agent_judge_evaluations_active Currently running evaluations.\n\
             # TYPE agent_judge_evaluations_active gauge\n\
             agent_judge_evaluations_active {}\n\
             # HELP agent_judge_evaluations_completed Evaluations that produced a composite result.\n\
             # TYPE agent_judge_evaluations_completed counter\n\
             agent_judge_evaluations_completed {}\n\
             # HELP agent_judge_evaluations_failed Evaluations rejected or unscorable.\n\
             # TYPE agent_judge_evaluations_failed counter\n\
             agent_judge_evaluations_failed {}\n\
             # HELP agent_judge_evaluations_partial Completed evaluations with at least one skipped tier.\n\
             # TYPE agent_judge_evaluations_partial counter\n\
             agent_judge_evaluations_partial {}\n\
             # HELP agent_judge_plugin_errors_total Plugin results with error status.\n\
             # TYPE agent_judge_plugin_errors_total counter\n\
             agent_judge_plugin_errors_total {}\n\
             # HELP agent_judge_duration_ms_sum Sum of evaluation durations in ms.\n\
             # TYPE agent_judge_duration_ms_sum counter\n\
             agent_judge_duration_ms_sum {}\n",
            total, active, completed, failed, partial, plugin_errors, dur_sum
        );

        out.push_str(
            "# HELP agent_judge_tier_skips_total Tiers skipped, by tier.\n\
             # TYPE agent_judge_tier_skips_total counter\n",
        );
        for tier in Tier::ALL {
            out.push_str(&format!(
                "agent_judge_tier_skips_total{{tier=\"{}\"}} {}\n",
                tier,
                self.tier_skip_count(tier)
            ));
        }
        out
    }
}
