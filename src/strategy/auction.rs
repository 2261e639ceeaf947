use super::{LoadBalancingStrategy, StrategyType};
use crate::transport::Rank;

/// Picks the peer with the largest queue. Ties go to the lowest rank.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuctionStrategy;

impl LoadBalancingStrategy for AuctionStrategy {
    fn select_donor(&mut self, loads: &[usize], me: Rank) -> Option<Rank> {
        let mut best: Option<(Rank, usize)> = None;
        for (rank, &load) in loads.iter().enumerate() {
            if rank == me || load == 0 {
                continue;
            }
            // strictly greater keeps the first maximum
            if best.map_or(true, |(_, max)| load > max) {
                best = Some((rank, load));
            }
        }
        best.map(|(rank, _)| rank)
    }

    fn kind(&self) -> StrategyType {
        StrategyType::Auction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_maximum() {
        assert_eq!(AuctionStrategy.select_donor(&[0, 5, 3, 0], 0), Some(1));
        assert_eq!(AuctionStrategy.select_donor(&[9, 1, 4, 7], 1), Some(0));
    }

    #[test]
    fn ignores_self_even_when_largest() {
        assert_eq!(AuctionStrategy.select_donor(&[0, 2, 10, 1], 2), Some(1));
    }

    #[test]
    fn ties_keep_lowest_rank() {
        assert_eq!(AuctionStrategy.select_donor(&[0, 4, 4, 4], 0), Some(1));
        assert_eq!(AuctionStrategy.select_donor(&[4, 4, 4, 0], 0), Some(1));
    }

    #[test]
    fn no_work_anywhere() {
        assert_eq!(AuctionStrategy.select_donor(&[0, 0, 0], 1), None);
        assert_eq!(AuctionStrategy.select_donor(&[0, 7], 1), None);
        assert_eq!(AuctionStrategy.select_donor(&[], 0), None);
    }
}
