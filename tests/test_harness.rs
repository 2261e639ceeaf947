//! Test harness for multi-rank DLML integration tests.
//!
//! Spawns whole groups inside the test process, one task per rank, and
//! collects each rank's result in rank order.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use dlml::config::{BalanceConfig, GroupConfig};
use dlml::strategy::StrategyType;
use dlml::transport::{Endpoint, MemoryNetwork, TcpNetwork};
use dlml::{Dlml, WorkItem};

/// A rank that has not finished by then is considered hung.
pub const GROUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Balance settings with the given strategy and rank 0 allowed to donate.
#[allow(dead_code)]
pub fn sharing(strategy: StrategyType) -> BalanceConfig {
    BalanceConfig::default()
        .with_strategy(strategy)
        .with_rank_zero_donor(true)
}

/// Run `body` on every rank of an in-process group of `size` ranks.
pub async fn run_group<T, R, F, Fut>(size: usize, balance: BalanceConfig, body: F) -> Vec<R>
where
    T: WorkItem,
    R: Send + 'static,
    F: Fn(Dlml<T>) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let handles = MemoryNetwork::endpoints(size)
        .into_iter()
        .map(|endpoint| {
            let dlml = Dlml::with_endpoint(endpoint, balance.clone()).expect("rank setup");
            tokio::spawn(body(dlml))
        })
        .collect();
    join_ranks(handles).await
}

/// Await every rank, failing the test if one hangs or panics.
pub async fn join_ranks<R>(handles: Vec<JoinHandle<R>>) -> Vec<R> {
    let mut results = Vec::with_capacity(handles.len());
    for (rank, handle) in handles.into_iter().enumerate() {
        let result = tokio::time::timeout(GROUP_TIMEOUT, handle)
            .await
            .unwrap_or_else(|_| panic!("rank {rank} did not finish in time"))
            .unwrap_or_else(|e| panic!("rank {rank} panicked: {e}"));
        results.push(result);
    }
    results
}

/// Pull items until the group runs out of work, optionally pausing after
/// each one so peers get a chance to ask for work.
pub async fn drain<T: WorkItem>(dlml: &mut Dlml<T>, pause: Option<Duration>) -> Vec<T> {
    let mut items = Vec::new();
    while let Some(item) = dlml.get().await.expect("get failed") {
        items.push(item);
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
    }
    items
}

/// Connect a TCP group of `size` ranks over loopback.
#[allow(dead_code)]
pub async fn tcp_endpoints(size: usize) -> Vec<Endpoint> {
    let mut listeners = Vec::with_capacity(size);
    for _ in 0..size {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.expect("bind"));
    }
    let addrs: Vec<_> = listeners
        .iter()
        .map(|l| l.local_addr().expect("local addr"))
        .collect();

    let handles = listeners
        .into_iter()
        .enumerate()
        .map(|(rank, listener)| {
            let mut config = GroupConfig::new(rank, addrs[rank]);
            for (peer, addr) in addrs.iter().enumerate().filter(|(peer, _)| *peer != rank) {
                config = config.with_peer(peer, addr.to_string());
            }
            tokio::spawn(async move {
                TcpNetwork::connect_with_listener(&config, listener)
                    .await
                    .expect("connect")
            })
        })
        .collect();
    join_ranks(handles).await
}
