//! Binding between the queue manager and the transport: owns the
//! destination table, routes outbound commands to the per-peer sequential
//! dispatchers, and pumps transport events (link changes, inbound frames)
//! into the per-peer sequential handlers.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use rq_common::EndpointAddress;
use rq_protocol::{ProtocolError, QueueSystemCommand};

use crate::destination::RemoteQueueSystemDestination;
use crate::manager::QueueManager;
use crate::transport::{MessageTransport, TransportEvent};

pub struct CollaborationManager {
    transport: Arc<dyn MessageTransport>,
    destinations: DashMap<EndpointAddress, Arc<RemoteQueueSystemDestination>>,
    command_queue_capacity: usize,
}

impl CollaborationManager {
    pub fn new(transport: Arc<dyn MessageTransport>, command_queue_capacity: usize) -> Self {
        Self {
            transport,
            destinations: DashMap::new(),
            command_queue_capacity,
        }
    }

    pub fn local_address(&self) -> &EndpointAddress {
        self.transport.local_address()
    }

    pub fn transport(&self) -> &Arc<dyn MessageTransport> {
        &self.transport
    }

    pub fn destination(&self, address: &EndpointAddress) -> Option<Arc<RemoteQueueSystemDestination>> {
        self.destinations.get(address).map(|entry| Arc::clone(entry.value()))
    }

    pub fn destinations(&self) -> Vec<Arc<RemoteQueueSystemDestination>> {
        self.destinations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Look up or create the destination for a peer, starting its worker
    /// loops on first sight.
    pub fn get_or_create_destination(
        &self,
        address: &EndpointAddress,
        manager: &Arc<QueueManager>,
    ) -> Arc<RemoteQueueSystemDestination> {
        if let Some(existing) = self.destination(address) {
            return existing;
        }
        // The entry lock serializes concurrent creators, so worker loops
        // are only spawned for the destination that takes the slot.
        self.destinations
            .entry(address.clone())
            .or_insert_with(|| {
                debug!(peer = %address, "Destination created");
                RemoteQueueSystemDestination::start(
                    address.clone(),
                    Arc::clone(manager),
                    Arc::clone(&self.transport),
                    self.command_queue_capacity,
                )
            })
            .clone()
    }

    /// Route an outbound command onto its destination's sequential
    /// dispatcher.
    pub async fn dispatch_command(&self, command: QueueSystemCommand, manager: &Arc<QueueManager>) {
        let destination = self.get_or_create_destination(command.address(), manager);
        destination
            .dispatch_command(command, manager, &self.transport)
            .await;
    }

    pub fn is_link_established(&self, address: &EndpointAddress) -> bool {
        self.destination(address)
            .map(|d| d.is_link_established())
            .unwrap_or(false)
    }

    pub async fn wait_for_link_established(
        &self,
        address: &EndpointAddress,
        timeout: Duration,
    ) -> bool {
        match self.destination(address) {
            Some(destination) => destination.wait_for_link_established(timeout).await,
            None => false,
        }
    }

    /// Spawn the transport event pump. Runs until the transport closes its
    /// event channel or the engine shuts down.
    pub fn start_event_pump(&self, manager: Arc<QueueManager>) {
        let Some(receiver) = self.transport.take_event_receiver() else {
            error!("Transport event receiver already taken; event pump not started");
            return;
        };
        tokio::spawn(run_event_pump(manager, receiver));
    }

    /// Destroy every destination, stopping their worker loops.
    pub async fn destroy_all(&self) {
        for destination in self.destinations() {
            destination.destination_destroyed().await;
        }
        self.destinations.clear();
    }
}

async fn run_event_pump(manager: Arc<QueueManager>, mut receiver: mpsc::Receiver<TransportEvent>) {
    info!("Transport event pump started");
    while let Some(event) = receiver.recv().await {
        if !manager.is_running() {
            break;
        }
        match event {
            TransportEvent::LinkUp(peer) => {
                info!(peer = %peer, "Transport link up");
                manager.destination_link_connected(&peer).await;
            }
            TransportEvent::LinkDown(peer) => {
                manager.destination_link_down(&peer).await;
            }
            TransportEvent::Frame { from, frame } => {
                match rq_protocol::decode(&frame, &from) {
                    Ok(command) => {
                        let destination = manager
                            .collaboration()
                            .get_or_create_destination(&from, &manager);
                        destination.handle_inbound_command(command, &manager).await;
                    }
                    Err(ProtocolError::VersionMismatch { expected, actual }) => {
                        // Cannot safely interpret an unknown wire layout.
                        warn!(
                            peer = %from,
                            expected = format_args!("{:#04x}", expected),
                            actual = format_args!("{:#04x}", actual),
                            "Dropping command with unsupported protocol version"
                        );
                    }
                    Err(e) => {
                        warn!(peer = %from, error = %e, "Dropping undecodable command frame");
                    }
                }
            }
        }
    }
    info!("Transport event pump stopped");
}
