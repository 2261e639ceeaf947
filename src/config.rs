use std::collections::HashSet;
use std::net::SocketAddr;

use crate::error::{DlmlError, Result};
use crate::strategy::StrategyType;
use crate::transport::Rank;

/// Default number of extra auctions a rank runs before declaring termination.
pub const DEFAULT_AUCTION_RETRIES: u32 = 2;

/// Load-balancing behaviour shared by every rank of a group.
///
/// All ranks should run with the same values; the protocol does not negotiate
/// them.
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    /// Donor-selection policy, fixed for the lifetime of the process.
    pub strategy: StrategyType,
    /// Auctions retried after the first empty one before this rank gives up.
    pub auction_retries: u32,
    /// Treat a donor choice of rank 0 as "no donor".
    ///
    /// Historical behaviour of the protocol. With it enabled rank 0 never
    /// donates work, so it ends up processing everything it started with.
    pub reject_rank_zero_donor: bool,
    /// Rank that receives reductions and gathers.
    pub root: Rank,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyType::Auction,
            auction_retries: DEFAULT_AUCTION_RETRIES,
            reject_rank_zero_donor: true,
            root: 0,
        }
    }
}

impl BalanceConfig {
    pub fn with_strategy(mut self, strategy: StrategyType) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_rank_zero_donor(mut self, allowed: bool) -> Self {
        self.reject_rank_zero_donor = !allowed;
        self
    }
}

/// Address of another rank in a TCP group.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub rank: Rank,
    pub addr: String, // host:port, resolved when dialling
}

/// Configuration for one rank of a TCP group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub rank: Rank,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    /// Give up bootstrapping if the full group is not connected by then.
    pub connect_timeout_ms: u64,
    /// Pause between dial attempts to a peer that is not listening yet.
    pub connect_retry_interval_ms: u64,
    pub balance: BalanceConfig,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:7400"
                .parse()
                .expect("default listen address is valid"),
            peers: Vec::new(),
            connect_timeout_ms: 10_000,
            connect_retry_interval_ms: 100,
            balance: BalanceConfig::default(),
        }
    }
}

impl GroupConfig {
    pub fn new(rank: Rank, listen_addr: SocketAddr) -> Self {
        Self {
            rank,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, rank: Rank, addr: String) -> Self {
        self.peers.push(PeerConfig { rank, addr });
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyType) -> Self {
        self.balance.strategy = strategy;
        self
    }

    /// Number of ranks in the group, this one included.
    pub fn group_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Check that this rank and its peers cover exactly `0..group_size()`.
    pub fn validate(&self) -> Result<()> {
        let size = self.group_size();
        let mut seen = HashSet::with_capacity(size);
        seen.insert(self.rank);

        for peer in &self.peers {
            if peer.rank == self.rank {
                return Err(DlmlError::Config(format!(
                    "rank {} lists itself as a peer",
                    self.rank
                )));
            }
            if !seen.insert(peer.rank) {
                return Err(DlmlError::Config(format!(
                    "rank {} appears more than once",
                    peer.rank
                )));
            }
        }

        if let Some(&rank) = seen.iter().find(|&&r| r >= size) {
            return Err(DlmlError::InvalidRank { rank, size });
        }
        if self.balance.root >= size {
            return Err(DlmlError::InvalidRank {
                rank: self.balance.root,
                size,
            });
        }
        Ok(())
    }
}
