use super::{BarrierMessage, Mailbox, Message, Outbox, Rank};
use crate::error::Result;

/// Block until every rank of the group has entered the barrier.
///
/// Non-root ranks report to `root` and wait for its release; the root waits
/// for all reports, then releases everyone. Because links are FIFO, anything a
/// rank sent before arriving has been delivered once the barrier returns.
pub async fn barrier(outbox: &Outbox, mailbox: &mut Mailbox, root: Rank) -> Result<()> {
    let me = outbox.rank();
    let size = outbox.size();
    if size <= 1 {
        return Ok(());
    }

    if me == root {
        let mut arrived = 1;
        while arrived < size {
            let envelope = mailbox.recv().await?;
            match envelope.message {
                Message::Barrier(BarrierMessage::Arrive) => arrived += 1,
                other => {
                    tracing::warn!(rank = me, from = envelope.source, message = ?other, "Unexpected barrier message");
                }
            }
        }
        for dest in (0..size).filter(|&r| r != root) {
            outbox.send(dest, Message::Barrier(BarrierMessage::Release))?;
        }
    } else {
        outbox.send(root, Message::Barrier(BarrierMessage::Arrive))?;
        loop {
            let envelope = mailbox.recv_from(root).await?;
            if envelope.message == Message::Barrier(BarrierMessage::Release) {
                break;
            }
            tracing::warn!(rank = me, message = ?envelope.message, "Unexpected barrier message");
        }
    }
    tracing::trace!(rank = me, "Barrier passed");
    Ok(())
}
