// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Smooth weighted round-robin over queue tiers.

use super::Tier;

/// Picks which tier a worker polls first.
///
/// Each pick adds every tier's weight to its running score, takes the tier
/// with the highest score and subtracts the total weight from it. Over one
/// cycle of 10 picks `critical`/`default`/`low` come up 6/3/1 times,
/// interleaved rather than in bursts.
#[derive(Debug, Clone)]
pub struct TierScheduler {
    current: [i64; 3],
}

impl Default for TierScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TierScheduler {
    /// Start a fresh cycle.
    pub fn new() -> Self {
        Self { current: [0; 3] }
    }

    /// Next tier in the weighted sequence.
    pub fn next_tier(&mut self) -> Tier {
        let total: i64 = Tier::ALL.iter().map(Tier::weight).sum();
        let mut best = 0;
        for (i, tier) in Tier::ALL.iter().enumerate() {
            self.current[i] += tier.weight();
            if self.current[i] > self.current[best] {
                best = i;
            }
        }
        self.current[best] -= total;
        Tier::ALL[best]
    }

    /// Polling order for one claim attempt: the picked tier, then the rest
    /// by weight. An empty tier never blocks the others.
    pub fn poll_order(&mut self) -> [Tier; 3] {
        let first = self.next_tier();
        let mut order = [first; 3];
        let mut slot = 1;
        for tier in Tier::ALL {
            if tier != first {
                order[slot] = tier;
                slot += 1;
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_matches_weights() {
        let mut scheduler = TierScheduler::new();
        let picks: Vec<Tier> = (0..10).map(|_| scheduler.next_tier()).collect();

        let count = |t: Tier| picks.iter().filter(|p| **p == t).count();
        assert_eq!(count(Tier::Critical), 6);
        assert_eq!(count(Tier::Default), 3);
        assert_eq!(count(Tier::Low), 1);
    }

    #[test]
    fn test_picks_are_interleaved() {
        let mut scheduler = TierScheduler::new();
        let picks: Vec<Tier> = (0..10).map(|_| scheduler.next_tier()).collect();

        // Never more than two critical picks in a row.
        assert!(
            picks
                .windows(3)
                .all(|w| !w.iter().all(|t| *t == Tier::Critical))
        );
    }

    #[test]
    fn test_poll_order_covers_every_tier() {
        let mut scheduler = TierScheduler::new();
        for _ in 0..20 {
            let order = scheduler.poll_order();
            for tier in Tier::ALL {
                assert_eq!(order.iter().filter(|t| **t == tier).count(), 1);
            }
        }
    }
}
