//! The protocol engine: one task per rank that owns the balancing protocol.
//!
//! The engine reacts to protocol messages from peers and from its own
//! application flow, runs auctions when the local queue runs dry, serves
//! donation requests, and counts termination declarations. When every rank of
//! the group has declared, it passes a group barrier, releases the
//! application's `round_done` wait and returns the resources it owned so the
//! next round can start a fresh engine on them.

pub mod donation;
mod handlers;
pub mod state;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::Bridge;
use crate::codec::Codec;
use crate::config::BalanceConfig;
use crate::error::{DlmlError, Result};
use crate::queue::LocalQueue;
use crate::strategy::LoadBalancingStrategy;
use crate::transport::{barrier, Envelope, Mailbox, Message, Outbox, Rank};
use state::RoundState;

/// Anything that can be queued and shipped between ranks.
pub trait WorkItem: Serialize + DeserializeOwned + Send + 'static {}

impl<T: Serialize + DeserializeOwned + Send + 'static> WorkItem for T {}

/// State shared by a rank's application flow and its engine.
#[derive(Debug)]
pub struct RankContext<T> {
    pub rank: Rank,
    pub size: usize,
    pub queue: Mutex<LocalQueue<T>>,
    pub bridge: Bridge,
}

impl<T> RankContext<T> {
    pub fn new(rank: Rank, size: usize) -> Self {
        Self {
            rank,
            size,
            queue: Mutex::new(LocalQueue::new()),
            bridge: Bridge::new(),
        }
    }
}

/// What an engine owns for the duration of a round and hands back at the end.
#[derive(Debug)]
pub struct EngineParts {
    pub protocol: mpsc::UnboundedReceiver<Envelope>,
    pub barrier: Mailbox,
    pub strategy: Box<dyn LoadBalancingStrategy>,
    pub link_fault: CancellationToken,
}

pub struct Engine<T, C> {
    ctx: Arc<RankContext<T>>,
    outbox: Outbox,
    codec: Arc<C>,
    config: BalanceConfig,
    parts: EngineParts,
    round: RoundState,
}

impl<T: WorkItem, C: Codec> Engine<T, C> {
    pub fn new(
        ctx: Arc<RankContext<T>>,
        outbox: Outbox,
        codec: Arc<C>,
        config: BalanceConfig,
        parts: EngineParts,
    ) -> Self {
        let round = RoundState::new(ctx.size);
        Self {
            ctx,
            outbox,
            codec,
            config,
            parts,
            round,
        }
    }

    /// Run one round on a new task.
    pub fn spawn(self) -> JoinHandle<Result<EngineParts>> {
        tokio::spawn(self.run())
    }

    /// Run until the whole group has terminated, then hand the parts back.
    ///
    /// A malformed frame on any inbound link fails the round. On failure the
    /// bridge is closed so an application flow blocked in `get` wakes up
    /// instead of waiting forever.
    pub async fn run(mut self) -> Result<EngineParts> {
        tracing::info!(
            rank = self.ctx.rank,
            size = self.ctx.size,
            strategy = %self.parts.strategy.kind(),
            "Round started"
        );
        let link_fault = self.parts.link_fault.clone();
        let outcome = tokio::select! {
            outcome = self.drive() => outcome,
            _ = link_fault.cancelled() => Err(DlmlError::Transport(
                "an inbound link delivered a malformed frame".to_string(),
            )),
        };
        match outcome {
            Ok(()) => {
                tracing::info!(rank = self.ctx.rank, "Round finished");
                self.ctx.bridge.release_round_done();
                Ok(self.parts)
            }
            Err(e) => {
                tracing::error!(rank = self.ctx.rank, error = %e, "Protocol engine failed");
                self.ctx.bridge.close();
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        while !self.round.is_over() {
            let envelope = self
                .parts
                .protocol
                .recv()
                .await
                .ok_or_else(|| DlmlError::Transport("protocol lane closed".to_string()))?;
            match envelope.message {
                Message::Protocol(message) => self.handle(envelope.source, message)?,
                other => {
                    tracing::warn!(
                        rank = self.ctx.rank,
                        from = envelope.source,
                        message = ?other,
                        "Non-protocol message on protocol lane"
                    );
                }
            }
        }
        barrier(&self.outbox, &mut self.parts.barrier, self.config.root).await
    }
}
