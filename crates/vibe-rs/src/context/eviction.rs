//! Eviction: decide which non-pinned messages survive a budget.
//!
//! Policies work on costs, not messages, so the same decision can back both
//! the mutating pass after `append` and the read-only view built by
//! `retrieve`. Pinned messages never reach a policy; their cost has already
//! been taken out of the allowance.

/// Result of an eviction decision over a cost list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Index of the first retained entry. Everything before it is evicted;
    /// everything from it onward is kept.
    pub keep_from: usize,
    /// Cost of the retained entries.
    pub retained_cost: usize,
    /// The retained entries exceed the allowance (a lone message too large
    /// to fit, which is kept rather than truncated).
    pub overflow: bool,
}

impl Retention {
    /// Number of entries evicted.
    pub fn evicted(&self) -> usize {
        self.keep_from
    }
}

/// Decides which of the ordered (oldest first) non-pinned messages to keep.
pub trait EvictionPolicy: Send + Sync {
    fn retain(&self, costs: &[usize], allowance: usize) -> Retention;
}

/// Effective allowance for non-pinned messages: `budget - pinned`, floored at zero.
pub fn effective_allowance(budget: usize, pinned_cost: usize) -> usize {
    budget.saturating_sub(pinned_cost)
}

/// Strict FIFO eviction.
///
/// Drops the oldest entry until the remainder fits in the allowance or only
/// the newest entry is left. The newest entry is never dropped: if it alone
/// exceeds the allowance it is kept and the result is flagged as overflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestFirst;

impl EvictionPolicy for OldestFirst {
    fn retain(&self, costs: &[usize], allowance: usize) -> Retention {
        let mut retained_cost: usize = costs.iter().sum();
        let mut keep_from = 0;

        while retained_cost > allowance && keep_from + 1 < costs.len() {
            retained_cost -= costs[keep_from];
            keep_from += 1;
        }

        Retention {
            keep_from,
            retained_cost,
            overflow: retained_cost > allowance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn everything_fits() {
        let r = OldestFirst.retain(&[10, 20, 30], 60);
        assert_eq!(r.keep_from, 0);
        assert_eq!(r.retained_cost, 60);
        assert!(!r.overflow);
    }

    #[test]
    fn evicts_oldest_first() {
        // budget 100 - pinned 20 = 80; [30, 30, 30] keeps the last two.
        let r = OldestFirst.retain(&[30, 30, 30], effective_allowance(100, 20));
        assert_eq!(r.keep_from, 1);
        assert_eq!(r.evicted(), 1);
        assert_eq!(r.retained_cost, 60);
        assert!(!r.overflow);
    }

    #[test]
    fn a_large_old_message_does_not_shield_newer_ones() {
        let r = OldestFirst.retain(&[70, 5, 5], 20);
        assert_eq!(r.keep_from, 1);
        assert_eq!(r.retained_cost, 10);
    }

    #[test]
    fn fifo_even_when_a_newer_message_is_larger() {
        // Dropping the 40 alone would fit, but FIFO must drop 5 first.
        let r = OldestFirst.retain(&[5, 40, 10], 45);
        assert_eq!(r.keep_from, 2);
        assert_eq!(r.retained_cost, 10);
    }

    #[test]
    fn lone_oversized_message_is_kept_and_flagged() {
        // budget 50 - pinned 10 = 40; a 60-token message alone.
        let r = OldestFirst.retain(&[60], effective_allowance(50, 10));
        assert_eq!(r.keep_from, 0);
        assert!(r.overflow);
    }

    #[test]
    fn newest_is_kept_even_when_it_alone_overflows() {
        let r = OldestFirst.retain(&[10, 10, 90], 40);
        assert_eq!(r.keep_from, 2);
        assert_eq!(r.retained_cost, 90);
        assert!(r.overflow);
    }

    #[test]
    fn empty_input_never_overflows() {
        let r = OldestFirst.retain(&[], 0);
        assert_eq!(r.keep_from, 0);
        assert_eq!(r.retained_cost, 0);
        assert!(!r.overflow);
    }

    #[test]
    fn allowance_floors_at_zero() {
        assert_eq!(effective_allowance(10, 25), 0);
        assert_eq!(effective_allowance(100, 20), 80);
    }

    #[test]
    fn zero_cost_messages_fit_zero_allowance() {
        let r = OldestFirst.retain(&[0, 0], 0);
        assert_eq!(r.keep_from, 0);
        assert!(!r.overflow);
    }
}
