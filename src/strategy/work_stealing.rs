use super::{LoadBalancingStrategy, StrategyType};
use crate::transport::Rank;

/// Minimum load/average ratio a peer needs to be considered overloaded.
pub const STEAL_THRESHOLD: f64 = 1.2;

/// Steals from the peer whose load is furthest above the group average.
///
/// The average includes the querying rank's own entry, which is usually zero
/// or stale because the local rank never reports to itself.
#[derive(Debug, Clone)]
pub struct WorkStealingStrategy {
    threshold: f64,
}

impl Default for WorkStealingStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkStealingStrategy {
    pub fn new() -> Self {
        Self {
            threshold: STEAL_THRESHOLD,
        }
    }
}

impl LoadBalancingStrategy for WorkStealingStrategy {
    fn select_donor(&mut self, loads: &[usize], me: Rank) -> Option<Rank> {
        if loads.is_empty() {
            return None;
        }
        let total: usize = loads.iter().sum();
        let average = total as f64 / loads.len() as f64;
        if average == 0.0 {
            return None;
        }

        let mut best: Option<(Rank, f64)> = None;
        for (rank, &load) in loads.iter().enumerate() {
            if rank == me {
                continue;
            }
            let ratio = load as f64 / average;
            if ratio > self.threshold && best.map_or(true, |(_, r)| ratio > r) {
                best = Some((rank, ratio));
            }
        }
        best.map(|(rank, _)| rank)
    }

    fn kind(&self) -> StrategyType {
        StrategyType::WorkStealing
    }
}
