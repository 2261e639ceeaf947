use super::donation::plan_split;
use super::{Engine, WorkItem};
use crate::codec::Codec;
use crate::error::Result;
use crate::transport::{ProtocolMessage, Rank};

impl<T: WorkItem, C: Codec> Engine<T, C> {
    pub(super) fn handle(&mut self, from: Rank, message: ProtocolMessage) -> Result<()> {
        tracing::trace!(rank = self.ctx.rank, from, message = ?message, "Protocol message");
        match message {
            ProtocolMessage::LocalQueueEmpty => self.on_local_queue_empty(),
            ProtocolMessage::SizeQuery => self.on_size_query(from),
            ProtocolMessage::SizeReportRequest => self.on_size_report_request(),
            ProtocolMessage::SizeReport { size } => self.on_size_report(from, size),
            ProtocolMessage::WorkBatch { items } => self.on_work_batch(from, items),
            ProtocolMessage::LocalQueueHasData => self.on_local_queue_has_data(),
            ProtocolMessage::DonationRequest => self.on_donation_request(from),
            ProtocolMessage::NoData => self.on_no_data(from),
            ProtocolMessage::TerminationDeclared => {
                self.round.terminations += 1;
                tracing::debug!(
                    rank = self.ctx.rank,
                    from,
                    terminations = self.round.terminations,
                    "Peer declared termination"
                );
                Ok(())
            }
        }
    }

    /// The application ran dry: refuse everyone waiting on us and start an
    /// auction for the loads of all peers.
    fn on_local_queue_empty(&mut self) -> Result<()> {
        self.refuse_donation_requests()?;
        self.answer_size_queries(0)?;

        self.round.begin_auction();
        self.outbox.broadcast_protocol(ProtocolMessage::SizeQuery)?;
        if self.round.all_reported() {
            self.conclude_auction()?;
        }
        Ok(())
    }

    fn on_size_query(&mut self, from: Rank) -> Result<()> {
        if self.round.declared || self.round.auction_in_flight {
            return self
                .outbox
                .send_protocol(from, ProtocolMessage::SizeReport { size: 0 });
        }
        // The queue belongs to the application; it reports at its next get.
        self.round.size_queries.push(from);
        self.ctx.bridge.set_size_requested(true);
        Ok(())
    }

    fn on_size_report_request(&mut self) -> Result<()> {
        let len = self.ctx.queue.lock().len();
        self.answer_size_queries(len as u64)?;
        self.ctx.bridge.release_work_ready();
        Ok(())
    }

    fn on_size_report(&mut self, from: Rank, size: u64) -> Result<()> {
        if !self.round.auction_in_flight {
            tracing::warn!(rank = self.ctx.rank, from, size, "Size report outside an auction");
            return Ok(());
        }
        let load = usize::try_from(size).unwrap_or(usize::MAX);
        if self.round.record_report(from, load) {
            self.conclude_auction()?;
        }
        Ok(())
    }

    /// Every peer reported: pick a donor, retry, or declare termination.
    fn conclude_auction(&mut self) -> Result<()> {
        let me = self.ctx.rank;
        let picked = self.parts.strategy.select_donor(&self.round.loads, me);
        let donor = picked.filter(|&d| !(self.config.reject_rank_zero_donor && d == 0));
        tracing::debug!(
            rank = me,
            loads = ?self.round.loads,
            picked = ?picked,
            donor = ?donor,
            "Auction concluded"
        );

        match donor {
            Some(donor) => {
                self.round.retries = 0;
                self.outbox
                    .send_protocol(donor, ProtocolMessage::DonationRequest)
            }
            None if self.round.retries < self.config.auction_retries => {
                self.round.retries += 1;
                tracing::debug!(rank = me, retry = self.round.retries, "No donor, retrying auction");
                self.outbox.notify_self(ProtocolMessage::LocalQueueEmpty)
            }
            None => self.declare_termination(),
        }
    }

    fn declare_termination(&mut self) -> Result<()> {
        tracing::info!(rank = self.ctx.rank, "No work left anywhere, declaring termination");
        self.round.declared = true;
        self.round.terminations += 1;
        self.ctx.bridge.release_work_ready();
        self.outbox
            .broadcast_protocol(ProtocolMessage::TerminationDeclared)?;
        self.refuse_donation_requests()?;
        self.answer_size_queries(0)
    }

    fn on_work_batch(&mut self, from: Rank, items: Vec<bytes::Bytes>) -> Result<()> {
        if items.is_empty() {
            // an empty batch is a refusal
            return self.on_no_data(from);
        }
        let decoded = items
            .iter()
            .map(|bytes| self.codec.decode::<T>(bytes))
            .collect::<Result<Vec<T>>>()?;
        let count = decoded.len();
        {
            let mut queue = self.ctx.queue.lock();
            for item in decoded {
                queue.push_donated(item);
            }
        }
        tracing::debug!(rank = self.ctx.rank, from, count, "Received work");

        if self.round.auction_in_flight {
            self.round.auction_in_flight = false;
            self.ctx.bridge.release_work_ready();
        } else {
            tracing::warn!(rank = self.ctx.rank, from, count, "Unrequested work batch queued");
        }
        Ok(())
    }

    fn on_no_data(&mut self, from: Rank) -> Result<()> {
        if !self.round.auction_in_flight {
            tracing::warn!(rank = self.ctx.rank, from, "Refusal outside an auction");
            return Ok(());
        }
        tracing::debug!(rank = self.ctx.rank, donor = from, "Donation refused");
        self.round.auction_in_flight = false;
        self.outbox.notify_self(ProtocolMessage::LocalQueueEmpty)
    }

    /// The application has items and handed us the queue: split it among the
    /// waiting requesters.
    fn on_local_queue_has_data(&mut self) -> Result<()> {
        let requesters: Vec<Rank> = self.round.donation_requests.drain(..).collect();
        let plan = plan_split(self.ctx.queue.lock().len(), requesters.len());

        for (requester, count) in requesters.into_iter().zip(plan) {
            if count == 0 {
                self.outbox.send_protocol(requester, ProtocolMessage::NoData)?;
                continue;
            }
            let taken = self.ctx.queue.lock().take_front(count);
            let items = taken
                .iter()
                .map(|item| self.codec.encode(item))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(rank = self.ctx.rank, to = requester, count, "Donating work");
            self.outbox
                .send_protocol(requester, ProtocolMessage::WorkBatch { items })?;
        }

        self.ctx.bridge.set_donation_pending(false);
        self.ctx.bridge.release_work_ready();
        Ok(())
    }

    fn on_donation_request(&mut self, from: Rank) -> Result<()> {
        if self.round.declared {
            return self.outbox.send_protocol(from, ProtocolMessage::NoData);
        }
        self.round.donation_requests.push_back(from);
        self.ctx.bridge.set_donation_pending(true);
        Ok(())
    }

    fn refuse_donation_requests(&mut self) -> Result<()> {
        while let Some(requester) = self.round.donation_requests.pop_front() {
            self.outbox.send_protocol(requester, ProtocolMessage::NoData)?;
        }
        self.ctx.bridge.set_donation_pending(false);
        Ok(())
    }

    fn answer_size_queries(&mut self, size: u64) -> Result<()> {
        for requester in std::mem::take(&mut self.round.size_queries) {
            self.outbox
                .send_protocol(requester, ProtocolMessage::SizeReport { size })?;
        }
        self.ctx.bridge.set_size_requested(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::codec::{Codec, JsonCodec};
    use crate::config::BalanceConfig;
    use crate::engine::{Engine, EngineParts, RankContext};
    use crate::error::Result;
    use crate::strategy::{create, StrategyType};
    use crate::transport::{
        barrier, Endpoint, Inbox, MemoryNetwork, Message, ProtocolMessage, Rank,
    };

    /// Rank 1's engine, with every other rank scripted by the test. Peers can
    /// also play rank 1's application, since self-notifications are only
    /// told apart by their kind.
    struct Harness {
        ctx: Arc<RankContext<u32>>,
        peers: Vec<Endpoint>,
        link_fault: CancellationToken,
        engine: tokio::task::JoinHandle<Result<EngineParts>>,
    }

    fn start() -> Harness {
        start_group(3)
    }

    fn start_group(size: usize) -> Harness {
        let mut endpoints = MemoryNetwork::endpoints(size);
        let Endpoint { outbox, inbox, .. } = endpoints.remove(1);
        let Inbox {
            protocol,
            barrier,
            link_fault,
            ..
        } = inbox;
        let ctx = Arc::new(RankContext::new(1, size));
        let parts = EngineParts {
            protocol,
            barrier,
            strategy: create(StrategyType::Auction),
            link_fault: link_fault.clone(),
        };
        let engine = Engine::new(
            ctx.clone(),
            outbox,
            Arc::new(JsonCodec),
            BalanceConfig::default(),
            parts,
        )
        .spawn();
        Harness {
            ctx,
            peers: endpoints,
            link_fault,
            engine,
        }
    }

    impl Harness {
        fn peer(&mut self, rank: Rank) -> &mut Endpoint {
            let index = if rank == 0 { 0 } else { rank - 1 };
            &mut self.peers[index]
        }

        fn send(&mut self, from: Rank, message: ProtocolMessage) {
            self.peer(from).outbox.send_protocol(1, message).unwrap();
        }

        async fn expect(&mut self, at: Rank, message: ProtocolMessage) {
            let env = tokio::time::timeout(
                Duration::from_secs(2),
                self.peer(at).inbox.protocol.recv(),
            )
            .await
            .expect("timed out")
            .expect("lane closed");
            assert_eq!(env.source, 1);
            assert_eq!(env.message, Message::Protocol(message));
        }

        async fn work_ready(&self) {
            tokio::time::timeout(Duration::from_secs(2), self.ctx.bridge.wait_work_ready())
                .await
                .expect("work_ready never released")
                .unwrap();
        }

        fn batch(&self, items: &[u32]) -> ProtocolMessage {
            ProtocolMessage::WorkBatch {
                items: items.iter().map(|i| JsonCodec.encode(i).unwrap()).collect(),
            }
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn size_query_is_answered_when_the_application_reports() {
        let mut h = start();
        h.ctx.queue.lock().push_local(5);
        h.ctx.queue.lock().push_local(6);

        h.send(0, ProtocolMessage::SizeQuery);
        let ctx = h.ctx.clone();
        eventually(|| ctx.bridge.size_requested()).await;

        h.send(2, ProtocolMessage::SizeReportRequest);
        h.expect(0, ProtocolMessage::SizeReport { size: 2 }).await;
        h.work_ready().await;
        assert!(!h.ctx.bridge.size_requested());
    }

    #[tokio::test]
    async fn donation_splits_queue_between_requesters() {
        let mut h = start();
        for i in 0..10u32 {
            h.ctx.queue.lock().push_donated(i);
        }

        h.send(0, ProtocolMessage::DonationRequest);
        h.send(2, ProtocolMessage::DonationRequest);
        let ctx = h.ctx.clone();
        eventually(|| ctx.bridge.donation_pending()).await;

        h.send(0, ProtocolMessage::LocalQueueHasData);
        let first = h.batch(&[0, 1, 2]);
        let second = h.batch(&[3, 4, 5]);
        h.expect(0, first).await;
        h.expect(2, second).await;
        h.work_ready().await;
        assert_eq!(h.ctx.queue.lock().len(), 4);
        assert!(!h.ctx.bridge.donation_pending());
    }

    #[tokio::test]
    async fn rank_zero_is_never_asked_and_donated_work_is_queued() {
        let mut h = start();
        h.send(2, ProtocolMessage::LocalQueueEmpty);
        h.expect(0, ProtocolMessage::SizeQuery).await;
        h.expect(2, ProtocolMessage::SizeQuery).await;

        // rank 0 is the richest, but it is filtered out: the auction is retried
        h.send(0, ProtocolMessage::SizeReport { size: 5 });
        h.send(2, ProtocolMessage::SizeReport { size: 3 });
        h.expect(0, ProtocolMessage::SizeQuery).await;
        h.expect(2, ProtocolMessage::SizeQuery).await;

        h.send(0, ProtocolMessage::SizeReport { size: 0 });
        h.send(2, ProtocolMessage::SizeReport { size: 3 });
        h.expect(2, ProtocolMessage::DonationRequest).await;

        let batch = h.batch(&[7]);
        h.send(2, batch);
        h.work_ready().await;
        assert_eq!(h.ctx.queue.lock().pop(), Some(7));
    }

    #[tokio::test]
    async fn refusal_restarts_the_auction() {
        let mut h = start();
        h.send(2, ProtocolMessage::LocalQueueEmpty);
        h.expect(0, ProtocolMessage::SizeQuery).await;
        h.expect(2, ProtocolMessage::SizeQuery).await;
        h.send(0, ProtocolMessage::SizeReport { size: 0 });
        h.send(2, ProtocolMessage::SizeReport { size: 4 });
        h.expect(2, ProtocolMessage::DonationRequest).await;

        h.send(2, ProtocolMessage::NoData);
        h.expect(0, ProtocolMessage::SizeQuery).await;
        h.expect(2, ProtocolMessage::SizeQuery).await;
    }

    #[tokio::test]
    async fn queries_during_an_auction_get_zero() {
        let mut h = start();
        h.ctx.queue.lock().push_local(1);
        h.send(2, ProtocolMessage::LocalQueueEmpty);
        h.expect(0, ProtocolMessage::SizeQuery).await;

        h.send(0, ProtocolMessage::SizeQuery);
        h.expect(0, ProtocolMessage::SizeReport { size: 0 }).await;
        assert!(!h.ctx.bridge.size_requested());
    }

    #[tokio::test]
    async fn running_dry_answers_deferred_queries_with_zero() {
        let mut h = start();
        h.ctx.queue.lock().push_local(1);
        h.send(0, ProtocolMessage::SizeQuery);
        let ctx = h.ctx.clone();
        eventually(|| ctx.bridge.size_requested()).await;

        h.send(2, ProtocolMessage::LocalQueueEmpty);
        h.expect(0, ProtocolMessage::SizeReport { size: 0 }).await;
        h.expect(0, ProtocolMessage::SizeQuery).await;
        h.expect(2, ProtocolMessage::SizeQuery).await;
        assert!(!h.ctx.bridge.size_requested());
    }

    #[tokio::test]
    async fn scarce_queue_donates_one_and_refuses_the_rest() {
        let mut h = start_group(4);
        h.ctx.queue.lock().push_donated(10);
        h.ctx.queue.lock().push_donated(11);

        for requester in [0, 2, 3] {
            h.send(requester, ProtocolMessage::DonationRequest);
        }
        let ctx = h.ctx.clone();
        eventually(|| ctx.bridge.donation_pending()).await;

        h.send(2, ProtocolMessage::LocalQueueHasData);
        let first = h.batch(&[10]);
        h.expect(0, first).await;
        h.expect(2, ProtocolMessage::NoData).await;
        h.expect(3, ProtocolMessage::NoData).await;
        h.work_ready().await;
        assert_eq!(h.ctx.queue.lock().len(), 1);
        assert_eq!(h.ctx.queue.lock().pop(), Some(11));
    }

    #[tokio::test]
    async fn link_fault_stops_the_engine() {
        let mut h = start();
        h.send(2, ProtocolMessage::LocalQueueEmpty);
        h.expect(0, ProtocolMessage::SizeQuery).await;

        h.link_fault.cancel();
        let err = h.engine.await.unwrap().unwrap_err();
        assert!(matches!(err, crate::error::DlmlError::Transport(_)));
        assert!(h.ctx.bridge.wait_work_ready().await.is_err());
    }

    #[tokio::test]
    async fn empty_auctions_end_in_termination_and_a_barrier() {
        let mut h = start();
        h.send(2, ProtocolMessage::LocalQueueEmpty);
        for _ in 0..3 {
            h.expect(0, ProtocolMessage::SizeQuery).await;
            h.expect(2, ProtocolMessage::SizeQuery).await;
            h.send(0, ProtocolMessage::SizeReport { size: 0 });
            h.send(2, ProtocolMessage::SizeReport { size: 0 });
        }
        h.expect(0, ProtocolMessage::TerminationDeclared).await;
        h.expect(2, ProtocolMessage::TerminationDeclared).await;
        h.work_ready().await;

        // a terminated rank refuses and reports nothing
        h.send(0, ProtocolMessage::DonationRequest);
        h.expect(0, ProtocolMessage::NoData).await;
        h.send(2, ProtocolMessage::SizeQuery);
        h.expect(2, ProtocolMessage::SizeReport { size: 0 }).await;

        h.send(0, ProtocolMessage::TerminationDeclared);
        h.send(2, ProtocolMessage::TerminationDeclared);

        let mut barriers = Vec::new();
        for mut peer in std::mem::take(&mut h.peers) {
            barriers.push(tokio::spawn(async move {
                barrier(&peer.outbox, &mut peer.inbox.barrier, 0).await
            }));
        }
        for b in barriers {
            b.await.unwrap().unwrap();
        }

        let parts = h.engine.await.unwrap().unwrap();
        assert_eq!(parts.strategy.kind(), StrategyType::Auction);
        tokio::time::timeout(Duration::from_secs(2), h.ctx.bridge.wait_round_done())
            .await
            .expect("round_done never released")
            .unwrap();
    }

    #[tokio::test]
    async fn undecodable_batch_stops_the_engine() {
        let mut h = start();
        h.send(2, ProtocolMessage::LocalQueueEmpty);
        h.expect(0, ProtocolMessage::SizeQuery).await;
        h.expect(2, ProtocolMessage::SizeQuery).await;
        h.send(0, ProtocolMessage::SizeReport { size: 0 });
        h.send(2, ProtocolMessage::SizeReport { size: 2 });
        h.expect(2, ProtocolMessage::DonationRequest).await;

        h.send(
            2,
            ProtocolMessage::WorkBatch {
                items: vec![bytes::Bytes::from_static(b"not json")],
            },
        );
        assert!(h.engine.await.unwrap().is_err());
        assert!(h.ctx.bridge.wait_work_ready().await.is_err());
    }
}
