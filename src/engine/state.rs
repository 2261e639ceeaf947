use std::collections::VecDeque;

use crate::transport::Rank;

/// Bookkeeping of the protocol engine for one round.
///
/// Created fresh each time the engine starts, so nothing leaks from one round
/// into the next.
#[derive(Debug)]
pub struct RoundState {
    /// Queue length reported by each rank in the current auction.
    pub loads: Vec<usize>,
    /// Peers that answered the current auction so far.
    pub reports: usize,
    /// Empty auctions in a row since the last successful one.
    pub retries: u32,
    /// Ranks (this one included) known to have declared termination.
    pub terminations: usize,
    /// Waiting for size reports or for a donor's answer.
    pub auction_in_flight: bool,
    /// This rank found no work anywhere and declared termination.
    pub declared: bool,
    /// Ranks waiting for a donation from this rank, in arrival order.
    pub donation_requests: VecDeque<Rank>,
    /// Ranks waiting for this rank's true queue length, in arrival order.
    pub size_queries: Vec<Rank>,
    size: usize,
}

impl RoundState {
    pub fn new(size: usize) -> Self {
        Self {
            loads: vec![0; size],
            reports: 0,
            retries: 0,
            terminations: 0,
            auction_in_flight: false,
            declared: false,
            donation_requests: VecDeque::new(),
            size_queries: Vec::new(),
            size,
        }
    }

    /// Reset the load vector for a new auction.
    pub fn begin_auction(&mut self) {
        self.loads.iter_mut().for_each(|l| *l = 0);
        self.reports = 0;
        self.auction_in_flight = true;
    }

    /// Record one peer's answer. Returns true once every peer has answered.
    pub fn record_report(&mut self, from: Rank, load: usize) -> bool {
        if let Some(slot) = self.loads.get_mut(from) {
            *slot = load;
        }
        self.reports += 1;
        self.all_reported()
    }

    pub fn all_reported(&self) -> bool {
        self.reports >= self.size.saturating_sub(1)
    }

    /// Every rank of the group has declared termination.
    pub fn is_over(&self) -> bool {
        self.terminations >= self.size
    }
}
