//! EventBus - per-workflow realtime fan-out of progress events.
//!
//! The bus is observational. Publishing never fails because nobody is
//! listening, and a subscriber that falls behind loses the oldest events
//! rather than slowing the driver down.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::workflow::Event;
use crate::{Error, Result};

/// Default buffer per channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Named broadcast channels keyed like `workflow:{id}:events`.
#[derive(Debug)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender(&self, channel: &str) -> Result<broadcast::Sender<Event>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| Error::Infrastructure("event bus lock poisoned".to_string()))?;
        Ok(channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone())
    }

    /// Publish to every current subscriber of `channel`. Returns how many
    /// subscribers received it.
    pub fn publish(&self, channel: &str, event: Event) -> Result<usize> {
        let tx = self.sender(channel)?;
        trace!(channel, kind = %event.kind, "publish");
        // No receivers is not an error.
        Ok(tx.send(event).unwrap_or(0))
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self, channel: &str) -> Result<EventStream> {
        Ok(EventStream {
            rx: self.sender(channel)?.subscribe(),
            channel: channel.to_string(),
        })
    }

    /// Drop a channel. Subscribers drain what is buffered and then end.
    pub fn close(&self, channel: &str) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(channel);
        }
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiving side of one channel.
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
    channel: String,
}

impl EventStream {
    /// Next event, or `None` once the channel is closed and drained.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Event> {
        stream::unfold(self, |mut events| async move {
            events.next().await.map(|event| (event, events))
        })
    }
}
