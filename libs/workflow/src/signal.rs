//! Named mailboxes for external events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::WorkflowError;

struct Mailbox {
    tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

/// Registry of signal channels.
///
/// A channel exists once it is first signalled or awaited. Signals sent
/// before anyone waits are buffered in arrival order; each one is delivered
/// to exactly one receiver. Buffered signals stay until received,
/// [`discard`](Self::discard)ed, or the channel is [`remove`](Self::remove)d.
#[derive(Clone, Default)]
pub struct SignalRegistry {
    channels: Arc<Mutex<HashMap<String, Arc<Mailbox>>>>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self, channel: &str) -> Arc<Mailbox> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            channels
                .entry(channel.to_string())
                .or_insert_with(|| Arc::new(Mailbox::new())),
        )
    }

    /// Deliver `payload` on `channel`.
    pub fn signal(&self, channel: &str, payload: Value) -> Result<(), WorkflowError> {
        let mailbox = self.mailbox(channel);
        let tx = mailbox.tx.lock().unwrap_or_else(PoisonError::into_inner);

        let closed = || WorkflowError::SignalClosed {
            channel: channel.to_string(),
        };

        tx.as_ref()
            .ok_or_else(closed)?
            .send(payload)
            .map_err(|_| closed())?;

        debug!(channel, "Signal delivered");
        Ok(())
    }

    /// Wait for the next payload on `channel`.
    ///
    /// Fails with [`WorkflowError::SignalClosed`] once the channel is closed
    /// and its buffered payloads are drained.
    pub async fn receive(&self, channel: &str) -> Result<Value, WorkflowError> {
        let mailbox = self.mailbox(channel);
        let mut rx = mailbox.rx.lock().await;

        rx.recv().await.ok_or_else(|| WorkflowError::SignalClosed {
            channel: channel.to_string(),
        })
    }

    /// Close `channel`. Later signals are rejected; waiters fail after
    /// draining what is already buffered.
    pub fn close(&self, channel: &str) {
        let mailbox = self.mailbox(channel);
        let mut tx = mailbox.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.take().is_some() {
            debug!(channel, "Signal channel closed");
        }
    }

    /// Drop every payload buffered on `channel`. The channel keeps its
    /// open or closed state. Returns the number of payloads dropped.
    ///
    /// A channel with a receiver currently waiting has nothing buffered and
    /// is left alone.
    pub fn discard(&self, channel: &str) -> usize {
        let Some(mailbox) = self.existing(channel) else {
            return 0;
        };
        let Ok(mut rx) = mailbox.rx.try_lock() else {
            return 0;
        };

        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(channel, dropped, "Discarded stale signals");
        }
        dropped
    }

    /// Forget `channel` along with anything buffered on it. A later signal
    /// or receive starts a fresh, open channel.
    pub fn remove(&self, channel: &str) -> bool {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel)
            .is_some();
        if removed {
            debug!(channel, "Signal channel removed");
        }
        removed
    }

    fn existing(&self, channel: &str) -> Option<Arc<Mailbox>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    /// Number of known channels.
    pub fn len(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
