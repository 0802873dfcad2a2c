//! Context usage reporting: how much of the budget a window currently uses.
//!
//! Usage is advisory. The window enforces its budget through eviction; these
//! levels only tell callers (and the logs) how close to the edge it is.

use serde::Serialize;

/// Threshold fractions at which usage is reported as elevated.
const WARNING_THRESHOLD: f64 = 0.60;
const CRITICAL_THRESHOLD: f64 = 0.80;

/// Coarse usage band.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum UsageLevel {
    Normal,
    Warning,
    Critical,
}

/// Snapshot of context usage at a point in time.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    /// Estimated tokens retained (pinned + history).
    pub estimated_tokens: usize,
    /// Budget the window enforces.
    pub budget: usize,
    /// Usage as a fraction (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    pub fn new(estimated_tokens: usize, budget: usize) -> Self {
        let usage_pct = if budget > 0 {
            estimated_tokens as f64 / budget as f64
        } else if estimated_tokens == 0 {
            0.0
        } else {
            1.0
        };
        Self {
            estimated_tokens,
            budget,
            usage_pct,
        }
    }

    pub fn level(&self) -> UsageLevel {
        if self.usage_pct >= CRITICAL_THRESHOLD {
            UsageLevel::Critical
        } else if self.usage_pct >= WARNING_THRESHOLD {
            UsageLevel::Warning
        } else {
            UsageLevel::Normal
        }
    }

    /// Tokens still available before the budget is reached.
    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.estimated_tokens)
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.budget,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_follow_thresholds() {
        assert_eq!(ContextUsage::new(10, 100).level(), UsageLevel::Normal);
        assert_eq!(ContextUsage::new(60, 100).level(), UsageLevel::Warning);
        assert_eq!(ContextUsage::new(80, 100).level(), UsageLevel::Critical);
        assert_eq!(ContextUsage::new(130, 100).level(), UsageLevel::Critical);
    }

    #[test]
    fn zero_budget() {
        assert_eq!(ContextUsage::new(0, 0).level(), UsageLevel::Normal);
        assert_eq!(ContextUsage::new(1, 0).level(), UsageLevel::Critical);
    }

    #[test]
    fn remaining_saturates() {
        assert_eq!(ContextUsage::new(30, 100).remaining(), 70);
        assert_eq!(ContextUsage::new(130, 100).remaining(), 0);
    }

    #[test]
    fn usage_log_string_format() {
        let log = ContextUsage::new(50, 200).to_log_string();
        assert_eq!(log, "context: ~50 tokens (25% of 200)");
    }
}
