//! In-process bus.
//!
//! [`MemoryBusHandle`] plays the simulator side: it publishes updates, can
//! wake a waiting reader without data, and observes everything the session
//! sends back. Dropping the handle closes the bus.

use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::mpsc::error::TryRecvError;

use super::{Bus, BusError, KvPairs};

#[derive(Debug)]
enum Delivery {
    Message(String, Value),
    Wakeup,
}

/// A message published by the session through `send_r`.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub destination: String,
    pub name: String,
    pub value: Value,
}

pub struct MemoryBus {
    inbox: UnboundedReceiver<Delivery>,
    pending: VecDeque<(String, Value)>,
    woken: bool,
    closed: bool,
    outbox: UnboundedSender<SentMessage>,
    joined: Vec<String>,
}

pub struct MemoryBusHandle {
    inbox: UnboundedSender<Delivery>,
    outbox: UnboundedReceiver<SentMessage>,
}

impl MemoryBus {
    pub fn new() -> (Self, MemoryBusHandle) {
        let (inbox_tx, inbox_rx) = unbounded_channel();
        let (outbox_tx, outbox_rx) = unbounded_channel();
        let bus = Self {
            inbox: inbox_rx,
            pending: VecDeque::new(),
            woken: false,
            closed: false,
            outbox: outbox_tx,
            joined: Vec::new(),
        };
        let handle = MemoryBusHandle {
            inbox: inbox_tx,
            outbox: outbox_rx,
        };
        (bus, handle)
    }

    fn accept(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Message(name, value) => self.pending.push_back((name, value)),
            Delivery::Wakeup => self.woken = true,
        }
    }

    fn drain_inbox(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(delivery) => self.accept(delivery),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

impl Bus for MemoryBus {
    async fn join(&mut self, names: &[String]) -> Result<(), BusError> {
        for name in names {
            if !self.joined.contains(name) {
                self.joined.push(name.clone());
            }
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<(), BusError> {
        self.drain_inbox();
        if !self.pending.is_empty() || self.woken {
            return Ok(());
        }
        if self.closed {
            return Err(BusError::Closed);
        }
        match self.inbox.recv().await {
            Some(delivery) => {
                self.accept(delivery);
                Ok(())
            }
            None => {
                self.closed = true;
                Err(BusError::Closed)
            }
        }
    }

    async fn sync_r(&mut self, n: usize) -> Result<KvPairs, BusError> {
        self.drain_inbox();
        self.woken = false;
        let take = n.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    async fn send_r(&mut self, destination: &str, mapping: KvPairs) -> Result<(), BusError> {
        for (name, value) in mapping {
            // Nobody observing the outbox is not an error for a fire-and-forget send
            let _ = self.outbox.send(SentMessage {
                destination: destination.to_string(),
                name,
                value,
            });
        }
        Ok(())
    }

    async fn devices(&mut self) -> Result<Vec<String>, BusError> {
        Ok(self.joined.clone())
    }
}

impl MemoryBusHandle {
    pub fn publish(&self, name: impl Into<String>, value: Value) -> Result<(), BusError> {
        self.inbox
            .send(Delivery::Message(name.into(), value))
            .map_err(|_| BusError::Closed)
    }

    /// Wake a waiting reader without delivering anything.
    pub fn wakeup(&self) -> Result<(), BusError> {
        self.inbox
            .send(Delivery::Wakeup)
            .map_err(|_| BusError::Closed)
    }

    pub async fn next_sent(&mut self) -> Option<SentMessage> {
        self.outbox.recv().await
    }

    pub fn try_sent(&mut self) -> Option<SentMessage> {
        self.outbox.try_recv().ok()
    }
}
