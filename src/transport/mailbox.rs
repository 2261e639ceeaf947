use std::collections::VecDeque;

use tokio::sync::mpsc;

use super::{Envelope, Rank};
use crate::error::{DlmlError, Result};

/// An inbox lane that can also wait for a specific sender.
///
/// Messages from other senders that arrive in the meantime are stashed and
/// handed out later in arrival order.
#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    stash: VecDeque<Envelope>,
}

impl Mailbox {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            rx,
            stash: VecDeque::new(),
        }
    }

    /// Next message from any sender.
    pub async fn recv(&mut self) -> Result<Envelope> {
        if let Some(envelope) = self.stash.pop_front() {
            return Ok(envelope);
        }
        self.rx.recv().await.ok_or_else(Self::closed)
    }

    /// Next message from `source`.
    pub async fn recv_from(&mut self, source: Rank) -> Result<Envelope> {
        if let Some(pos) = self.stash.iter().position(|e| e.source == source) {
            if let Some(envelope) = self.stash.remove(pos) {
                return Ok(envelope);
            }
        }
        loop {
            let envelope = self.rx.recv().await.ok_or_else(Self::closed)?;
            if envelope.source == source {
                return Ok(envelope);
            }
            self.stash.push_back(envelope);
        }
    }

    fn closed() -> DlmlError {
        DlmlError::Transport("inbox lane closed".to_string())
    }
}
