use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::wire::EnvelopeCodec;
use super::{lanes, Endpoint, Envelope, IoTasks, LaneSenders, Link, Outbox, Rank};
use crate::config::{GroupConfig, PeerConfig};
use crate::error::{DlmlError, Result};

/// How long an inbound connection may take to name its rank.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// One rank per process, one TCP stream per ordered pair of ranks.
///
/// Each rank dials every peer and writes its own rank as a 4-byte handshake;
/// that stream then only carries traffic from the dialler to the listener, so
/// per-pair FIFO order is the stream's byte order. Inbound streams are read by
/// one task each and routed into the local inbox lanes.
pub struct TcpNetwork;

impl TcpNetwork {
    /// Bind `config.listen_addr` and connect to the whole group.
    pub async fn connect(config: &GroupConfig) -> Result<Endpoint> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        Self::connect_with_listener(config, listener).await
    }

    /// Like [`TcpNetwork::connect`] with an already bound listener.
    pub async fn connect_with_listener(
        config: &GroupConfig,
        listener: TcpListener,
    ) -> Result<Endpoint> {
        config.validate()?;
        let rank = config.rank;
        let size = config.group_size();
        let deadline = Duration::from_millis(config.connect_timeout_ms);
        let retry = Duration::from_millis(config.connect_retry_interval_ms);

        tracing::info!(
            rank,
            size,
            addr = %listener.local_addr()?,
            "Bootstrapping TCP group"
        );

        let (local_lanes, inbox) = lanes();
        let cancel = CancellationToken::new();
        let accept = tokio::spawn(accept_peers(
            listener,
            rank,
            size,
            local_lanes.clone(),
            cancel.clone(),
        ));
        let stop_accepting = accept.abort_handle();

        let mut links: Vec<Option<Link>> = (0..size).map(|_| None).collect();
        links[rank] = Some(Link::Direct(local_lanes));
        let mut writers = Vec::with_capacity(config.peers.len());

        for peer in &config.peers {
            let stream = match timeout(deadline, dial(peer, rank, retry)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    accept.abort();
                    return Err(e);
                }
                Err(_) => {
                    accept.abort();
                    return Err(DlmlError::Transport(format!(
                        "timed out connecting to rank {} at {}",
                        peer.rank, peer.addr
                    )));
                }
            };
            let (tx, rx) = mpsc::unbounded_channel();
            writers.push(tokio::spawn(write_loop(peer.rank, stream, rx)));
            links[peer.rank] = Some(Link::Stream(tx));
        }

        let readers = match timeout(deadline, accept).await {
            Ok(joined) => joined
                .map_err(|e| DlmlError::Internal(format!("accept task failed: {e}")))??,
            Err(_) => {
                stop_accepting.abort();
                return Err(DlmlError::Transport(
                    "timed out waiting for peers to connect".to_string(),
                ));
            }
        };

        let links: Vec<Link> = links
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| DlmlError::Internal("group has an unconnected rank".to_string()))?;

        tracing::info!(rank, size, "TCP group connected");

        Ok(Endpoint {
            outbox: Outbox::new(rank, Arc::new(links)),
            inbox,
            io: IoTasks {
                writers,
                readers,
                cancel,
            },
        })
    }
}

async fn dial(peer: &PeerConfig, me: Rank, retry: Duration) -> Result<TcpStream> {
    let handshake = u32::try_from(me)
        .map_err(|_| DlmlError::Config(format!("rank {me} does not fit the handshake")))?;
    let mut attempts = 0u32;
    loop {
        match TcpStream::connect(&peer.addr).await {
            Ok(mut stream) => {
                stream.set_nodelay(true)?;
                stream.write_u32(handshake).await?;
                tracing::info!(rank = me, peer = peer.rank, addr = %peer.addr, "Connected to peer");
                return Ok(stream);
            }
            Err(e) => {
                attempts += 1;
                if attempts == 1 {
                    tracing::warn!(
                        peer = peer.rank,
                        addr = %peer.addr,
                        error = %e,
                        "Peer not reachable yet, retrying"
                    );
                } else {
                    tracing::trace!(peer = peer.rank, attempts, "Dial retry");
                }
                tokio::time::sleep(retry).await;
            }
        }
    }
}

async fn accept_peers(
    listener: TcpListener,
    me: Rank,
    size: usize,
    lanes: LaneSenders,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let expected = size.saturating_sub(1);
    let mut readers = Vec::with_capacity(expected);
    let mut seen = HashSet::with_capacity(expected);

    while readers.len() < expected {
        let (mut stream, addr) = listener.accept().await?;
        let peer = match timeout(HANDSHAKE_TIMEOUT, stream.read_u32()).await {
            Ok(Ok(peer)) => peer as usize,
            Ok(Err(e)) => {
                tracing::warn!(addr = %addr, error = %e, "Handshake failed, dropping connection");
                continue;
            }
            Err(_) => {
                tracing::warn!(addr = %addr, "Handshake timed out, dropping connection");
                continue;
            }
        };
        if peer == me || peer >= size || !seen.insert(peer) {
            tracing::warn!(peer, addr = %addr, "Rejecting unexpected connection");
            continue;
        }
        stream.set_nodelay(true)?;
        tracing::debug!(peer, addr = %addr, "Accepted link");
        readers.push(tokio::spawn(read_loop(
            peer,
            stream,
            lanes.clone(),
            cancel.clone(),
        )));
    }
    Ok(readers)
}

async fn read_loop(peer: Rank, stream: TcpStream, lanes: LaneSenders, cancel: CancellationToken) {
    let mut frames = FramedRead::new(stream, EnvelopeCodec::new());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(mut envelope)) => {
                    if envelope.source != peer {
                        tracing::warn!(peer, claimed = envelope.source, "Source mismatch on link");
                        envelope.source = peer;
                    }
                    if lanes.deliver(envelope).is_err() {
                        tracing::debug!(peer, "Inbox dropped, stopping reader");
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(peer, error = %e, "Bad frame, closing link");
                    lanes.report_link_fault();
                    break;
                }
                None => {
                    tracing::debug!(peer, "Peer closed link");
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    peer: Rank,
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) -> Result<()> {
    let mut sink = FramedWrite::new(stream, EnvelopeCodec::new());
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = sink.send(envelope).await {
            tracing::error!(peer, error = %e, "Failed to write to peer");
            return Err(e);
        }
    }
    sink.close().await?;
    tracing::debug!(peer, "Link flushed and closed");
    Ok(())
}
