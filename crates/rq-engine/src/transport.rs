//! The transport seam: a reliable, ordered frame carrier to named peers.
//!
//! The engine only needs `send`, connectivity queries, and a stream of
//! transport events (link up/down, inbound frames). The in-process
//! implementation wires nodes together through tokio channels; demos and
//! tests use it to run several queue systems in one process.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rq_common::EndpointAddress;

use crate::{EngineError, Result};

/// Events delivered by the transport to the collaboration layer.
#[derive(Debug)]
pub enum TransportEvent {
    LinkUp(EndpointAddress),
    LinkDown(EndpointAddress),
    Frame {
        from: EndpointAddress,
        frame: Bytes,
    },
}

/// Reliable ordered frame transport to named destinations.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn local_address(&self) -> &EndpointAddress;

    /// Deliver one frame to a connected peer. Fails when no link exists.
    async fn send(&self, to: &EndpointAddress, frame: Bytes) -> Result<()>;

    /// Transport-level connectivity (says nothing about synchronization).
    fn is_connected(&self, to: &EndpointAddress) -> bool;

    /// Hand over the event receiver. Yields once; the collaboration layer
    /// pumps it for the lifetime of the engine.
    fn take_event_receiver(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Hub connecting in-process transports by name.
pub struct InProcessNetwork {
    mailboxes: DashMap<EndpointAddress, mpsc::Sender<TransportEvent>>,
    links: Mutex<HashSet<(EndpointAddress, EndpointAddress)>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mailboxes: DashMap::new(),
            links: Mutex::new(HashSet::new()),
        })
    }

    /// Register a node and obtain its transport endpoint. Registering an
    /// existing name replaces its mailbox (a restarted node).
    pub fn register(self: &Arc<Self>, name: impl Into<String>) -> Arc<InProcessTransport> {
        let address = EndpointAddress::new(name);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.mailboxes.insert(address.clone(), tx);

        Arc::new(InProcessTransport {
            network: Arc::clone(self),
            local: address,
            receiver: Mutex::new(Some(rx)),
        })
    }

    /// Establish a bidirectional link; both sides observe LinkUp.
    pub async fn connect(&self, a: &EndpointAddress, b: &EndpointAddress) {
        self.links.lock().insert(link_key(a, b));
        self.post(a, TransportEvent::LinkUp(b.clone())).await;
        self.post(b, TransportEvent::LinkUp(a.clone())).await;
    }

    /// Drop a link; both sides observe LinkDown.
    pub async fn disconnect(&self, a: &EndpointAddress, b: &EndpointAddress) {
        if self.links.lock().remove(&link_key(a, b)) {
            self.post(a, TransportEvent::LinkDown(b.clone())).await;
            self.post(b, TransportEvent::LinkDown(a.clone())).await;
        }
    }

    /// Simulate a node crash: remove its mailbox and all its links. Peers
    /// observe LinkDown; the node itself is gone until re-registered.
    pub async fn crash(&self, node: &EndpointAddress) {
        self.mailboxes.remove(node);
        let dropped: Vec<(EndpointAddress, EndpointAddress)> = {
            let mut links = self.links.lock();
            let dropped = links
                .iter()
                .filter(|(a, b)| a == node || b == node)
                .cloned()
                .collect();
            links.retain(|(a, b)| a != node && b != node);
            dropped
        };
        for (a, b) in dropped {
            let peer = if &a == node { b } else { a };
            self.post(&peer, TransportEvent::LinkDown(node.clone())).await;
        }
    }

    pub fn is_linked(&self, a: &EndpointAddress, b: &EndpointAddress) -> bool {
        self.links.lock().contains(&link_key(a, b))
    }

    async fn post(&self, to: &EndpointAddress, event: TransportEvent) {
        let sender = match self.mailboxes.get(to) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(peer = %to, "Dropping transport event for unknown node");
                return;
            }
        };
        if sender.send(event).await.is_err() {
            warn!(peer = %to, "Transport event receiver gone");
        }
    }
}

fn link_key(a: &EndpointAddress, b: &EndpointAddress) -> (EndpointAddress, EndpointAddress) {
    if a.as_str() <= b.as_str() {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// One node's endpoint on the in-process network.
pub struct InProcessTransport {
    network: Arc<InProcessNetwork>,
    local: EndpointAddress,
    receiver: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl InProcessTransport {
    pub fn network(&self) -> &Arc<InProcessNetwork> {
        &self.network
    }
}

#[async_trait]
impl MessageTransport for InProcessTransport {
    fn local_address(&self) -> &EndpointAddress {
        &self.local
    }

    async fn send(&self, to: &EndpointAddress, frame: Bytes) -> Result<()> {
        if !self.network.is_linked(&self.local, to) {
            return Err(EngineError::NoLink(to.clone()));
        }

        let sender = self
            .network
            .mailboxes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::NoLink(to.clone()))?;

        sender
            .send(TransportEvent::Frame {
                from: self.local.clone(),
                frame,
            })
            .await
            .map_err(|_| EngineError::NoLink(to.clone()))
    }

    fn is_connected(&self, to: &EndpointAddress) -> bool {
        self.network.is_linked(&self.local, to)
    }

    fn take_event_receiver(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.receiver.lock().take()
    }
}
