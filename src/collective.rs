//! Reductions and gathers toward the root rank.
//!
//! Every rank must call the same collectives in the same order. Contributions
//! travel on their own inbox lane and are matched by sender, so they never mix
//! with protocol traffic and a fast rank's next contribution waits its turn.

use std::ops::Add;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::dlml::Dlml;
use crate::engine::WorkItem;
use crate::error::{DlmlError, Result};
use crate::transport::{Mailbox, Message, Outbox, Rank};

impl<T: WorkItem, C: Codec> Dlml<T, C> {
    /// Sum `value` over all ranks. The root gets the total; every other rank
    /// gets its own value back.
    pub async fn reduce_add<V>(&mut self, value: V) -> Result<V>
    where
        V: Add<Output = V> + Serialize + DeserializeOwned,
    {
        self.reduce(value, |acc, other| acc + other).await
    }

    /// Fold every rank's `value` into one at the root, in rank order. Every
    /// other rank gets its own value back.
    pub async fn reduce<V, F>(&mut self, value: V, combine: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnMut(V, V) -> V,
    {
        let root = self.root();
        let codec = self.codec.clone();
        let outbox = self.outbox().clone();
        reduce_to_root(&outbox, &mut self.collective, codec.as_ref(), root, value, combine).await
    }

    /// Collect every rank's `value` at the root, indexed by rank. Other ranks
    /// get an empty vector.
    pub async fn gather<V>(&mut self, value: V) -> Result<Vec<V>>
    where
        V: Serialize + DeserializeOwned,
    {
        let root = self.root();
        let codec = self.codec.clone();
        let outbox = self.outbox().clone();
        gather_to_root(&outbox, &mut self.collective, codec.as_ref(), root, value).await
    }

    /// Run `action` on the root only.
    pub fn run_on_one<R>(&self, action: impl FnOnce() -> R) -> Option<R> {
        self.is_root().then(action)
    }
}

async fn reduce_to_root<V, C, F>(
    outbox: &Outbox,
    mailbox: &mut Mailbox,
    codec: &C,
    root: Rank,
    value: V,
    mut combine: F,
) -> Result<V>
where
    V: Serialize + DeserializeOwned,
    C: Codec,
    F: FnMut(V, V) -> V,
{
    if outbox.rank() != root {
        outbox.send(root, Message::Collective(codec.encode(&value)?))?;
        return Ok(value);
    }
    let mut acc = value;
    for peer in (0..outbox.size()).filter(|&r| r != root) {
        let other = receive(mailbox, codec, peer).await?;
        acc = combine(acc, other);
    }
    Ok(acc)
}

async fn gather_to_root<V, C>(
    outbox: &Outbox,
    mailbox: &mut Mailbox,
    codec: &C,
    root: Rank,
    value: V,
) -> Result<Vec<V>>
where
    V: Serialize + DeserializeOwned,
    C: Codec,
{
    if outbox.rank() != root {
        outbox.send(root, Message::Collective(codec.encode(&value)?))?;
        return Ok(Vec::new());
    }
    let mut own = Some(value);
    let mut gathered = Vec::with_capacity(outbox.size());
    for rank in 0..outbox.size() {
        if rank != root {
            gathered.push(receive(mailbox, codec, rank).await?);
        } else if let Some(value) = own.take() {
            gathered.push(value);
        }
    }
    Ok(gathered)
}

async fn receive<V, C>(mailbox: &mut Mailbox, codec: &C, from: Rank) -> Result<V>
where
    V: DeserializeOwned,
    C: Codec,
{
    let envelope = mailbox.recv_from(from).await?;
    match envelope.message {
        Message::Collective(bytes) => codec.decode(&bytes),
        other => Err(DlmlError::Internal(format!(
            "expected a collective contribution from rank {from}, got {other:?}"
        ))),
    }
}
