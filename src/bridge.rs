//! Handshake between the application flow and the protocol engine.
//!
//! The application side only touches the local queue on its fast path. Any
//! other access is requested by sending the engine a self-addressed message and
//! then waiting on [`Bridge::wait_work_ready`] until the engine hands the queue
//! back. [`Bridge::wait_round_done`] is released once per round after the
//! group has agreed that no work is left.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;

use crate::error::{DlmlError, Result};

#[derive(Debug)]
pub struct Bridge {
    work_ready: Semaphore,
    round_done: Semaphore,
    /// Peers asked this rank for work and are waiting for an answer.
    donation_pending: AtomicBool,
    /// A peer asked for this rank's queue length outside of an auction.
    size_requested: AtomicBool,
    /// The last round finished; the next `get` starts a new one.
    terminated: AtomicBool,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            work_ready: Semaphore::new(0),
            round_done: Semaphore::new(0),
            donation_pending: AtomicBool::new(false),
            size_requested: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Hand the queue back to the application flow.
    pub fn release_work_ready(&self) {
        self.work_ready.add_permits(1);
    }

    pub async fn wait_work_ready(&self) -> Result<()> {
        Self::acquire(&self.work_ready).await
    }

    pub fn release_round_done(&self) {
        self.round_done.add_permits(1);
    }

    pub async fn wait_round_done(&self) -> Result<()> {
        Self::acquire(&self.round_done).await
    }

    /// Wake every waiter with [`DlmlError::EngineStopped`]. Used when the
    /// engine dies, so a blocked `get` does not hang forever.
    pub fn close(&self) {
        self.work_ready.close();
        self.round_done.close();
    }

    async fn acquire(signal: &Semaphore) -> Result<()> {
        let permit = signal
            .acquire()
            .await
            .map_err(|_| DlmlError::EngineStopped)?;
        permit.forget();
        Ok(())
    }

    pub fn donation_pending(&self) -> bool {
        self.donation_pending.load(Ordering::SeqCst)
    }

    pub fn set_donation_pending(&self, value: bool) {
        self.donation_pending.store(value, Ordering::SeqCst);
    }

    pub fn size_requested(&self) -> bool {
        self.size_requested.load(Ordering::SeqCst)
    }

    pub fn set_size_requested(&self, value: bool) {
        self.size_requested.store(value, Ordering::SeqCst);
    }

    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn set_terminated(&self, value: bool) {
        self.terminated.store(value, Ordering::SeqCst);
    }
}
