//! Cost accounting contract and a budget-enforcing reference meter.

use tracing::debug;

use crate::config::BudgetConfig;
use crate::core::types::{CostRecord, PlanStatus};
use crate::error::{EngineError, Result};

pub trait CostMeter {
    /// Fail with [`EngineError::BudgetExceeded`] once spending exceeds any
    /// limit. Spending exactly the limit is still within budget.
    fn check_budget(&self) -> Result<()>;

    fn record_task_cost(&mut self, record: &CostRecord);
}

/// Accumulates task costs in memory and compares them with configured limits.
#[derive(Debug, Clone)]
pub struct BudgetMeter {
    limits: BudgetConfig,
    spent: CostRecord,
}

impl BudgetMeter {
    pub fn new(limits: BudgetConfig) -> Self {
        Self {
            limits,
            spent: CostRecord::default(),
        }
    }

    /// Start from the costs already recorded in `status`, so a resumed run
    /// keeps counting against the same budget.
    pub fn resuming(limits: BudgetConfig, status: &PlanStatus) -> Self {
        Self {
            limits,
            spent: status.total_cost(),
        }
    }

    pub fn spent(&self) -> &CostRecord {
        &self.spent
    }
}

impl CostMeter for BudgetMeter {
    fn check_budget(&self) -> Result<()> {
        if let Some(max) = self.limits.max_usd {
            if self.spent.usd > max {
                return Err(EngineError::BudgetExceeded(format!(
                    "spent ${:.4} of ${max:.4}",
                    self.spent.usd
                )));
            }
        }
        if let Some(max) = self.limits.max_tokens {
            if self.spent.tokens > max {
                return Err(EngineError::BudgetExceeded(format!(
                    "used {} of {max} tokens",
                    self.spent.tokens
                )));
            }
        }
        if let Some(max) = self.limits.max_cpu_seconds {
            if self.spent.cpu_seconds > max {
                return Err(EngineError::BudgetExceeded(format!(
                    "used {:.3}s of {max:.3}s cpu",
                    self.spent.cpu_seconds
                )));
            }
        }
        Ok(())
    }

    fn record_task_cost(&mut self, record: &CostRecord) {
        self.spent.cpu_seconds += record.cpu_seconds;
        self.spent.mem_bytes = self.spent.mem_bytes.max(record.mem_bytes);
        self.spent.tokens += record.tokens;
        self.spent.usd += record.usd;
        debug!(
            usd = self.spent.usd,
            tokens = self.spent.tokens,
            cpu_seconds = self.spent.cpu_seconds,
            "cost recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_budget_never_trips() {
        let mut meter = BudgetMeter::new(BudgetConfig::default());
        meter.record_task_cost(&CostRecord {
            cpu_seconds: 1e6,
            mem_bytes: 1,
            tokens: 1_000_000,
            usd: 1e6,
        });
        meter.check_budget().expect("no limits");
    }

    #[test]
    fn usd_limit_trips_once_exceeded() {
        let mut meter = BudgetMeter::new(BudgetConfig {
            max_usd: Some(1.0),
            ..BudgetConfig::default()
        });
        meter.check_budget().expect("fresh budget");
        meter.record_task_cost(&CostRecord {
            usd: 1.0,
            ..CostRecord::default()
        });
        meter.check_budget().expect("spending the whole limit is allowed");
        meter.record_task_cost(&CostRecord {
            usd: 0.25,
            ..CostRecord::default()
        });
        let err = meter.check_budget().unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded(_)));
    }

    #[test]
    fn zero_limits_allow_nothing_beyond_zero() {
        let mut meter = BudgetMeter::new(BudgetConfig {
            max_usd: Some(0.0),
            max_tokens: Some(0),
            ..BudgetConfig::default()
        });
        meter.check_budget().expect("nothing spent yet");
        meter.record_task_cost(&CostRecord {
            tokens: 1,
            ..CostRecord::default()
        });
        assert!(matches!(
            meter.check_budget(),
            Err(EngineError::BudgetExceeded(_))
        ));
    }

    #[test]
    fn resuming_counts_previous_costs() {
        let mut status = PlanStatus::draft("p");
        status.upsert(crate::core::types::TaskStatusEntry {
            task_id_ref: "a".to_string(),
            status: crate::core::types::TaskOutcome::Done,
            g_last_update: 1,
            cost_record: CostRecord {
                cpu_seconds: 5.0,
                ..CostRecord::default()
            },
        });
        let meter = BudgetMeter::resuming(
            BudgetConfig {
                max_cpu_seconds: Some(4.0),
                ..BudgetConfig::default()
            },
            &status,
        );
        assert_eq!(meter.spent().cpu_seconds, 5.0);
        assert!(meter.check_budget().is_err());
    }
}
