//! Interrupt epoch shared between the barge-in coordinator and the stages it cancels.
//!
//! The coordinator owns the only [`InterruptSignal`]. Each raised interruption
//! bumps a monotonically increasing epoch; stages hold an [`InterruptListener`]
//! and race it against every await point so cancellation is observed within one
//! scheduling step, well before the in-band [`PipelineEvent::Interruption`]
//! reaches them.
//!
//! [`PipelineEvent::Interruption`]: super::messages::PipelineEvent::Interruption

use tokio::sync::watch;

/// Writer side of the interrupt epoch.
#[derive(Debug)]
pub struct InterruptSignal {
    tx: watch::Sender<u64>,
}

impl Default for InterruptSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSignal {
    /// Create a signal at epoch 0.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Raise an interruption and return the new epoch.
    pub fn raise(&self) -> u64 {
        self.tx.send_modify(|epoch| *epoch += 1);
        *self.tx.borrow()
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        *self.tx.borrow()
    }

    /// A listener that observes interruptions raised after this call.
    pub fn subscribe(&self) -> InterruptListener {
        InterruptListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reader side of the interrupt epoch.
#[derive(Debug, Clone)]
pub struct InterruptListener {
    rx: watch::Receiver<u64>,
}

impl InterruptListener {
    /// Wait for the next interruption and return its epoch.
    ///
    /// Cancel-safe. Never resolves once the signal has been dropped.
    pub async fn interrupted(&mut self) -> u64 {
        match self.rx.changed().await {
            Ok(()) => *self.rx.borrow_and_update(),
            Err(_) => std::future::pending().await,
        }
    }

    /// Latest epoch, whether or not it has been observed.
    pub fn epoch(&self) -> u64 {
        *self.rx.borrow()
    }
}
