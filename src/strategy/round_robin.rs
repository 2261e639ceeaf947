use super::{LoadBalancingStrategy, StrategyType};
use crate::transport::Rank;

/// Walks the ranks circularly from where the previous call stopped and picks
/// the first peer that has any work, regardless of how much.
///
/// The cursor keeps moving on a failed scan. A full circle with no candidate
/// advances it `loads.len()` positions, so it ends on the rank it started
/// from and the next scan begins one past it, as if nothing had been scanned.
#[derive(Debug, Default, Clone)]
pub struct RoundRobinStrategy {
    /// Last visited rank. `None` before the first scan.
    cursor: Option<Rank>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> Option<Rank> {
        self.cursor
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_donor(&mut self, loads: &[usize], me: Rank) -> Option<Rank> {
        let n = loads.len();
        for _ in 0..n {
            let next = self.cursor.map_or(0, |c| (c + 1) % n);
            self.cursor = Some(next);
            if next != me && loads[next] > 0 {
                return Some(next);
            }
        }
        None
    }

    fn kind(&self) -> StrategyType {
        StrategyType::RoundRobin
    }
}
