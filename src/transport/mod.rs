//! Rank-to-rank messaging.
//!
//! Every rank gets an [`Endpoint`]: an [`Outbox`] able to reach any rank of
//! the group (itself included) and an [`Inbox`] split into three lanes so the
//! protocol engine, the collective helpers and the group barrier never consume
//! each other's messages.
//!
//! Delivery between any ordered pair of ranks is reliable and FIFO. Self-sends
//! go through the same lanes as remote messages, so a message a rank sends to
//! itself is queued behind everything it already received.
//!
//! Two backends build endpoints:
//! - [`MemoryNetwork`]: all ranks in one process, wired with channels.
//! - [`TcpNetwork`]: one rank per process, one TCP stream per ordered pair.

pub mod barrier;
pub mod mailbox;
pub mod memory;
pub mod tcp;
pub mod wire;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DlmlError, Result};

pub use barrier::barrier;
pub use mailbox::Mailbox;
pub use memory::MemoryNetwork;
pub use tcp::TcpNetwork;

/// Index of a process in the group, `0..size`.
pub type Rank = usize;

/// Messages exchanged by the load-balancing protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    /// Self: the local queue ran dry (or an auction is being retried).
    LocalQueueEmpty,
    /// Peer: asks for this rank's queue length.
    SizeQuery,
    /// Self: the application is ready to report the true queue length.
    SizeReportRequest,
    /// Peer: answer to a [`ProtocolMessage::SizeQuery`].
    SizeReport { size: u64 },
    /// Donor: encoded work items, appended to the receiver's queue.
    WorkBatch { items: Vec<Bytes> },
    /// Self: the queue has items and donation requests are waiting.
    LocalQueueHasData,
    /// Peer: asks this rank to donate work.
    DonationRequest,
    /// Donor: refused a donation request.
    NoData,
    /// Peer: that rank found no work anywhere and is done for this round.
    TerminationDeclared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierMessage {
    Arrive,
    Release,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Protocol(ProtocolMessage),
    /// Encoded contribution to a reduction or gather.
    Collective(Bytes),
    Barrier(BarrierMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: Rank,
    pub message: Message,
}

/// Senders into one rank's three inbox lanes.
#[derive(Debug, Clone)]
pub(crate) struct LaneSenders {
    protocol: mpsc::UnboundedSender<Envelope>,
    collective: mpsc::UnboundedSender<Envelope>,
    barrier: mpsc::UnboundedSender<Envelope>,
    link_fault: CancellationToken,
}

impl LaneSenders {
    /// Route an envelope to its lane. Returns it back if the lane is gone.
    pub(crate) fn deliver(&self, envelope: Envelope) -> std::result::Result<(), Envelope> {
        let lane = match envelope.message {
            Message::Protocol(_) => &self.protocol,
            Message::Collective(_) => &self.collective,
            Message::Barrier(_) => &self.barrier,
        };
        lane.send(envelope).map_err(|e| e.0)
    }

    /// An inbound link broke mid-stream; wake whoever waits on this rank.
    pub(crate) fn report_link_fault(&self) {
        self.link_fault.cancel();
    }
}

/// Create the lanes of one rank.
pub(crate) fn lanes() -> (LaneSenders, Inbox) {
    let (protocol_tx, protocol_rx) = mpsc::unbounded_channel();
    let (collective_tx, collective_rx) = mpsc::unbounded_channel();
    let (barrier_tx, barrier_rx) = mpsc::unbounded_channel();
    let link_fault = CancellationToken::new();
    (
        LaneSenders {
            protocol: protocol_tx,
            collective: collective_tx,
            barrier: barrier_tx,
            link_fault: link_fault.clone(),
        },
        Inbox {
            protocol: protocol_rx,
            collective: Mailbox::new(collective_rx),
            barrier: Mailbox::new(barrier_rx),
            link_fault,
        },
    )
}

#[derive(Debug)]
pub(crate) enum Link {
    /// Straight into the destination's lanes (same process).
    Direct(LaneSenders),
    /// Through the writer task of a TCP stream.
    Stream(mpsc::UnboundedSender<Envelope>),
}

/// Sending half of an endpoint. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Outbox {
    rank: Rank,
    links: Arc<Vec<Link>>,
}

impl Outbox {
    pub(crate) fn new(rank: Rank, links: Arc<Vec<Link>>) -> Self {
        Self { rank, links }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.links.len()
    }

    pub fn send(&self, dest: Rank, message: Message) -> Result<()> {
        let link = self.links.get(dest).ok_or(DlmlError::InvalidRank {
            rank: dest,
            size: self.links.len(),
        })?;
        let envelope = Envelope {
            source: self.rank,
            message,
        };
        tracing::trace!(from = self.rank, to = dest, message = ?envelope.message, "send");
        let delivered = match link {
            Link::Direct(lanes) => lanes.deliver(envelope).is_ok(),
            Link::Stream(tx) => tx.send(envelope).is_ok(),
        };
        if delivered {
            Ok(())
        } else {
            Err(DlmlError::PeerDisconnected(dest))
        }
    }

    pub fn send_protocol(&self, dest: Rank, message: ProtocolMessage) -> Result<()> {
        self.send(dest, Message::Protocol(message))
    }

    /// Send to this rank's own protocol lane.
    pub fn notify_self(&self, message: ProtocolMessage) -> Result<()> {
        self.send_protocol(self.rank, message)
    }

    /// Send to every rank except this one.
    pub fn broadcast_protocol(&self, message: ProtocolMessage) -> Result<()> {
        for dest in (0..self.size()).filter(|&r| r != self.rank) {
            self.send_protocol(dest, message.clone())?;
        }
        Ok(())
    }
}

/// Receiving half of an endpoint.
#[derive(Debug)]
pub struct Inbox {
    pub protocol: mpsc::UnboundedReceiver<Envelope>,
    pub collective: Mailbox,
    pub barrier: Mailbox,
    /// Cancelled when an inbound link delivers a malformed frame. Messages
    /// from that peer are lost from then on.
    pub link_fault: CancellationToken,
}

/// Background I/O owned by an endpoint (empty for in-memory groups).
#[derive(Debug, Default)]
pub(crate) struct IoTasks {
    pub(crate) writers: Vec<JoinHandle<Result<()>>>,
    pub(crate) readers: Vec<JoinHandle<()>>,
    pub(crate) cancel: CancellationToken,
}

/// One rank's connection to the group.
#[derive(Debug)]
pub struct Endpoint {
    pub outbox: Outbox,
    pub inbox: Inbox,
    pub(crate) io: IoTasks,
}

impl Endpoint {
    pub fn rank(&self) -> Rank {
        self.outbox.rank()
    }

    pub fn size(&self) -> usize {
        self.outbox.size()
    }

    /// Drop this endpoint and flush its outgoing links. Clones of the outbox
    /// must be dropped first or their links stay open.
    pub async fn shutdown(self) -> Result<()> {
        let Endpoint { outbox, inbox, io } = self;
        drop(outbox);
        drop(inbox);
        io.shutdown().await
    }
}

impl IoTasks {
    /// Flush and stop the background I/O. Call after the last send; any
    /// `Outbox` clone still alive keeps its writer running until dropped.
    pub(crate) async fn shutdown(self) -> Result<()> {
        let mut result = Ok(());
        for writer in self.writers {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(e) => result = Err(DlmlError::Internal(format!("writer task failed: {e}"))),
            }
        }
        self.cancel.cancel();
        for reader in self.readers {
            let _ = reader.await;
        }
        result
    }
}
