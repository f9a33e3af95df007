//! Stop signalling
//!
//! Broadcast-based signal used both for node-wide shutdown and as the
//! dedicated stop signal paired with every watch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shutdown signal broadcaster
///
/// Use subscribe() to get a listener, then clone the signal for distribution.
/// A listener created after the signal fired still observes it.
pub struct ShutdownSignal {
    sender: Arc<broadcast::Sender<()>>,
    fired: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender: Arc::new(sender),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }

    /// Whether shutdown has been triggered
    pub fn is_shutdown(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Create a new listener for this signal
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
            fired: self.fired.clone(),
        }
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            fired: self.fired.clone(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a [`ShutdownSignal`]
pub struct ShutdownListener {
    receiver: broadcast::Receiver<()>,
    fired: Arc<AtomicBool>,
}

impl Clone for ShutdownListener {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            fired: self.fired.clone(),
        }
    }
}

impl ShutdownListener {
    /// Resolve once the signal has fired. Cancel safe.
    pub async fn recv(&mut self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.receiver.recv().await;
    }
}
