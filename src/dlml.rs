use std::sync::Arc;

use crate::codec::{Codec, JsonCodec};
use crate::config::{BalanceConfig, GroupConfig};
use crate::engine::{Engine, EngineParts, RankContext, WorkItem};
use crate::error::{DlmlError, Result};
use crate::strategy::create;
use crate::transport::{
    barrier, Endpoint, Inbox, IoTasks, Mailbox, Outbox, ProtocolMessage, Rank, TcpNetwork,
};

enum EngineSlot {
    /// Between rounds; restarted by the next `get`.
    Idle(EngineParts),
    Running(tokio::task::JoinHandle<Result<EngineParts>>),
    /// The engine failed and its error has been reported.
    Gone,
}

/// One rank's handle on a dynamically load-balanced work list.
///
/// The application inserts items and pulls them back with [`Dlml::get`]. When
/// the local queue runs dry `get` transparently asks the rest of the group for
/// work, and returns `None` only once every rank has run out. After that the
/// same handle can be reused for another round: the next `get` starts one.
///
/// Every rank of the group must drive the same sequence of rounds and
/// collectives, and must call [`Dlml::finalize`] last.
pub struct Dlml<T, C = JsonCodec> {
    ctx: Arc<RankContext<T>>,
    outbox: Outbox,
    pub(crate) collective: Mailbox,
    pub(crate) codec: Arc<C>,
    balance: BalanceConfig,
    engine: EngineSlot,
    io: IoTasks,
}

impl<T: WorkItem> Dlml<T, JsonCodec> {
    /// Join a TCP group as described by `config`.
    pub async fn init(config: &GroupConfig) -> Result<Self> {
        let endpoint = TcpNetwork::connect(config).await?;
        Self::with_endpoint(endpoint, config.balance.clone())
    }

    /// Run on an already connected endpoint, e.g. from a
    /// [`MemoryNetwork`](crate::transport::MemoryNetwork).
    pub fn with_endpoint(endpoint: Endpoint, balance: BalanceConfig) -> Result<Self> {
        Self::with_codec(endpoint, balance, JsonCodec)
    }
}

impl<T: WorkItem, C: Codec> Dlml<T, C> {
    pub fn with_codec(endpoint: Endpoint, balance: BalanceConfig, codec: C) -> Result<Self> {
        let Endpoint { outbox, inbox, io } = endpoint;
        let rank = outbox.rank();
        let size = outbox.size();
        if balance.root >= size {
            return Err(DlmlError::InvalidRank {
                rank: balance.root,
                size,
            });
        }
        let Inbox {
            protocol,
            collective,
            barrier,
            link_fault,
        } = inbox;

        tracing::info!(rank, size, strategy = %balance.strategy, "DLML rank ready");

        let parts = EngineParts {
            protocol,
            barrier,
            strategy: create(balance.strategy),
            link_fault,
        };
        let mut dlml = Self {
            ctx: Arc::new(RankContext::new(rank, size)),
            outbox,
            collective,
            codec: Arc::new(codec),
            balance,
            engine: EngineSlot::Idle(parts),
            io,
        };
        dlml.start_engine()?;
        Ok(dlml)
    }

    pub fn rank(&self) -> Rank {
        self.ctx.rank
    }

    pub fn size(&self) -> usize {
        self.ctx.size
    }

    /// Rank that receives reductions and gathers.
    pub fn root(&self) -> Rank {
        self.balance.root
    }

    pub fn is_root(&self) -> bool {
        self.rank() == self.root()
    }

    pub(crate) fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Add a work item to this rank's queue. Never blocks on the network.
    pub fn insert(&self, item: T) {
        self.ctx.queue.lock().push_local(item);
    }

    /// Items currently queued on this rank.
    pub fn local_len(&self) -> usize {
        self.ctx.queue.lock().len()
    }

    /// Next work item, or `None` once the whole group is out of work.
    ///
    /// Blocks while this rank searches for work elsewhere.
    pub async fn get(&mut self) -> Result<Option<T>> {
        let ctx = self.ctx.clone();
        if ctx.bridge.terminated() {
            self.restart_engine().await?;
        }

        if ctx.bridge.size_requested() {
            self.outbox.notify_self(ProtocolMessage::SizeReportRequest)?;
            self.wait_work_ready().await?;
        }

        if !ctx.bridge.donation_pending() {
            if let Some(item) = self.pop_local() {
                return Ok(Some(item));
            }
        } else if self.local_len() > 0 {
            self.outbox.notify_self(ProtocolMessage::LocalQueueHasData)?;
            self.wait_work_ready().await?;
            if let Some(item) = self.pop_local() {
                return Ok(Some(item));
            }
        }

        self.outbox.notify_self(ProtocolMessage::LocalQueueEmpty)?;
        self.wait_work_ready().await?;
        if let Some(item) = self.pop_local() {
            return Ok(Some(item));
        }

        ctx.bridge.set_terminated(true);
        let done = ctx.bridge.wait_round_done().await;
        self.engine_outcome(done).await?;
        tracing::debug!(rank = ctx.rank, "Group out of work");
        Ok(None)
    }

    /// Leave the group. Call after the last `get` returned `None` and after the
    /// last collective; blocks until every rank has called it.
    pub async fn finalize(mut self) -> Result<()> {
        let mut parts = match std::mem::replace(&mut self.engine, EngineSlot::Gone) {
            EngineSlot::Idle(parts) => parts,
            EngineSlot::Running(handle) => join_engine(handle).await?,
            EngineSlot::Gone => return Err(DlmlError::EngineStopped),
        };
        barrier(&self.outbox, &mut parts.barrier, self.balance.root).await?;

        let Self { ctx, outbox, io, .. } = self;
        drop(outbox);
        io.shutdown().await?;
        tracing::info!(rank = ctx.rank, "DLML rank finalized");
        Ok(())
    }

    fn pop_local(&self) -> Option<T> {
        self.ctx.queue.lock().pop()
    }

    fn start_engine(&mut self) -> Result<()> {
        let EngineSlot::Idle(parts) = std::mem::replace(&mut self.engine, EngineSlot::Gone) else {
            return Err(DlmlError::Internal("engine is not idle".to_string()));
        };
        let engine = Engine::new(
            self.ctx.clone(),
            self.outbox.clone(),
            self.codec.clone(),
            self.balance.clone(),
            parts,
        );
        self.engine = EngineSlot::Running(engine.spawn());
        Ok(())
    }

    async fn restart_engine(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.engine, EngineSlot::Gone) {
            EngineSlot::Running(handle) => {
                let parts = join_engine(handle).await?;
                self.engine = EngineSlot::Idle(parts);
            }
            idle @ EngineSlot::Idle(_) => self.engine = idle,
            EngineSlot::Gone => return Err(DlmlError::EngineStopped),
        }
        self.ctx.bridge.set_terminated(false);
        tracing::debug!(rank = self.ctx.rank, "Starting new round");
        self.start_engine()
    }

    async fn wait_work_ready(&mut self) -> Result<()> {
        let waited = self.ctx.bridge.wait_work_ready().await;
        self.engine_outcome(waited).await
    }

    /// A closed bridge means the engine died: report its error instead.
    async fn engine_outcome(&mut self, waited: Result<()>) -> Result<()> {
        match waited {
            Err(DlmlError::EngineStopped) => {
                match std::mem::replace(&mut self.engine, EngineSlot::Gone) {
                    EngineSlot::Running(handle) => match join_engine(handle).await {
                        Err(e) => Err(e),
                        Ok(_) => Err(DlmlError::EngineStopped),
                    },
                    _ => Err(DlmlError::EngineStopped),
                }
            }
            other => other,
        }
    }
}

async fn join_engine(handle: tokio::task::JoinHandle<Result<EngineParts>>) -> Result<EngineParts> {
    handle
        .await
        .map_err(|e| DlmlError::Internal(format!("protocol engine task failed: {e}")))?
}
