//! Donor selection for auctions.
//!
//! When a rank runs out of work it collects the queue length of every other
//! rank into a load vector (indexed by rank) and asks its strategy which peer
//! should donate. Three policies are available:
//!
//! - [`AuctionStrategy`]: the most loaded peer.
//! - [`RoundRobinStrategy`]: the next loaded peer after a persistent cursor.
//! - [`WorkStealingStrategy`]: the peer furthest above the group average.
//!
//! The strategy is picked once at startup via [`create`] and lives as long as
//! the process, across rounds.

pub mod auction;
pub mod round_robin;
pub mod work_stealing;

use std::convert::Infallible;
use std::str::FromStr;

pub use auction::AuctionStrategy;
pub use round_robin::RoundRobinStrategy;
pub use work_stealing::WorkStealingStrategy;

use crate::transport::Rank;

/// Environment variable consulted by [`StrategyType::from_env`].
pub const STRATEGY_ENV: &str = "DLML_STRATEGY";

/// A donor-selection policy.
pub trait LoadBalancingStrategy: Send + Sync + std::fmt::Debug {
    /// Pick the rank that should donate work to `me`, given the last reported
    /// queue length of every rank. Never returns `me`.
    fn select_donor(&mut self, loads: &[usize], me: Rank) -> Option<Rank>;

    fn kind(&self) -> StrategyType;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyType {
    #[default]
    Auction,
    RoundRobin,
    WorkStealing,
}

impl StrategyType {
    /// Lenient parse: unknown names fall back to [`StrategyType::Auction`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "roundrobin" | "round_robin" => StrategyType::RoundRobin,
            "workstealing" | "work_stealing" => StrategyType::WorkStealing,
            "auction" => StrategyType::Auction,
            other => {
                tracing::warn!(strategy = other, "Unknown strategy, using auction");
                StrategyType::Auction
            }
        }
    }

    /// Read the strategy from `DLML_STRATEGY`, defaulting to auction.
    pub fn from_env() -> Self {
        std::env::var(STRATEGY_ENV)
            .map(|v| Self::from_name(&v))
            .unwrap_or_default()
    }
}

impl FromStr for StrategyType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyType::Auction => write!(f, "auction"),
            StrategyType::RoundRobin => write!(f, "round_robin"),
            StrategyType::WorkStealing => write!(f, "work_stealing"),
        }
    }
}

/// Build a fresh strategy of the given kind.
pub fn create(kind: StrategyType) -> Box<dyn LoadBalancingStrategy> {
    match kind {
        StrategyType::Auction => Box::new(AuctionStrategy),
        StrategyType::RoundRobin => Box::new(RoundRobinStrategy::new()),
        StrategyType::WorkStealing => Box::new(WorkStealingStrategy::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_both_spellings() {
        assert_eq!(StrategyType::from_name("auction"), StrategyType::Auction);
        assert_eq!(StrategyType::from_name("RoundRobin"), StrategyType::RoundRobin);
        assert_eq!(StrategyType::from_name(" round_robin "), StrategyType::RoundRobin);
        assert_eq!(StrategyType::from_name("WORKSTEALING"), StrategyType::WorkStealing);
        assert_eq!(StrategyType::from_name("work_stealing"), StrategyType::WorkStealing);
    }

    #[test]
    fn parse_unknown_falls_back_to_auction() {
        assert_eq!(StrategyType::from_name("fastest"), StrategyType::Auction);
        assert_eq!(StrategyType::from_name(""), StrategyType::Auction);
        assert_eq!("bogus".parse::<StrategyType>().unwrap(), StrategyType::Auction);
    }

    #[test]
    fn display_round_trips_through_parse() {
        for kind in [
            StrategyType::Auction,
            StrategyType::RoundRobin,
            StrategyType::WorkStealing,
        ] {
            assert_eq!(StrategyType::from_name(&kind.to_string()), kind);
        }
    }

    #[test]
    fn factory_builds_requested_kind() {
        for kind in [
            StrategyType::Auction,
            StrategyType::RoundRobin,
            StrategyType::WorkStealing,
        ] {
            assert_eq!(create(kind).kind(), kind);
        }
    }

    /// Load vector `[0, 5, 3, 0]` seen from rank 0.
    #[test]
    fn strategies_agree_on_reference_loads() {
        let loads = [0, 5, 3, 0];
        for kind in [
            StrategyType::Auction,
            StrategyType::RoundRobin,
            StrategyType::WorkStealing,
        ] {
            assert_eq!(create(kind).select_donor(&loads, 0), Some(1), "{kind}");
        }
    }
}
