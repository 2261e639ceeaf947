use std::sync::Arc;

use super::{lanes, Endpoint, IoTasks, Link, Outbox};

/// A group of ranks living in one process, connected by unbounded channels.
///
/// Useful for tests and for running a whole computation on one machine
/// without sockets. Channels keep per-sender order, which is all the protocol
/// needs.
pub struct MemoryNetwork;

impl MemoryNetwork {
    /// Build endpoints for ranks `0..size`, in rank order.
    pub fn endpoints(size: usize) -> Vec<Endpoint> {
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| lanes()).unzip();
        let links: Arc<Vec<Link>> = Arc::new(senders.into_iter().map(Link::Direct).collect());

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Endpoint {
                outbox: Outbox::new(rank, links.clone()),
                inbox,
                io: IoTasks::default(),
            })
            .collect()
    }
}
