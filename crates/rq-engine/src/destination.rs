//! Per-peer proxy: link/synchronization state, flow-control estimates, and
//! the two sequential worker loops that preserve strict per-peer command
//! ordering regardless of how the transport multiplexes connections.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use rq_common::{EndpointAddress, QueueSystemMetaData};
use rq_protocol::QueueSystemCommand;

use crate::manager::QueueManager;
use crate::transport::MessageTransport;

/// Link state machine per destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Transport link is up but the synchronization handshake has not
    /// completed; application traffic must not flow yet.
    ConnectedUnsynchronized,
    Synchronized,
    Destroyed,
}

enum DispatcherMsg {
    Command(QueueSystemCommand),
    LinkLost,
    Destroy,
}

enum HandlerMsg {
    Command(QueueSystemCommand),
    Destroy,
}

/// One remote queue system.
pub struct RemoteQueueSystemDestination {
    address: EndpointAddress,
    link_state: Mutex<LinkState>,
    synchronization_complete: AtomicBool,
    meta_data: Mutex<QueueSystemMetaData>,
    /// Locally tracked estimate of the remote in-queue length: incremented
    /// optimistically per dispatch, corrected authoritatively on every
    /// metadata arrival.
    expected_remote_in_queue_length: AtomicI64,
    dispatcher_tx: mpsc::Sender<DispatcherMsg>,
    handler_tx: mpsc::Sender<HandlerMsg>,
    link_notify: Notify,
}

impl RemoteQueueSystemDestination {
    /// Create the destination and spawn its sequential handler and
    /// dispatcher loops.
    pub fn start(
        address: EndpointAddress,
        manager: Arc<QueueManager>,
        transport: Arc<dyn MessageTransport>,
        command_queue_capacity: usize,
    ) -> Arc<Self> {
        let (dispatcher_tx, dispatcher_rx) = mpsc::channel(command_queue_capacity);
        let (handler_tx, handler_rx) = mpsc::channel(command_queue_capacity);

        let destination = Arc::new(Self {
            address,
            link_state: Mutex::new(LinkState::Disconnected),
            synchronization_complete: AtomicBool::new(false),
            meta_data: Mutex::new(QueueSystemMetaData::default()),
            expected_remote_in_queue_length: AtomicI64::new(0),
            dispatcher_tx,
            handler_tx,
            link_notify: Notify::new(),
        });

        tokio::spawn(run_dispatcher(
            Arc::clone(&destination),
            Arc::clone(&manager),
            transport,
            dispatcher_rx,
        ));
        tokio::spawn(run_handler(Arc::clone(&manager), handler_rx, destination.address.clone()));

        destination
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    // ------------------------------------------------------------------
    // Link state
    // ------------------------------------------------------------------

    pub fn link_state(&self) -> LinkState {
        *self.link_state.lock()
    }

    /// Transport link is up and the synchronization handshake completed.
    pub fn is_link_established(&self) -> bool {
        self.link_state() == LinkState::Synchronized
            && self.synchronization_complete.load(Ordering::SeqCst)
    }

    pub fn is_synchronization_complete(&self) -> bool {
        self.synchronization_complete.load(Ordering::SeqCst)
    }

    /// Transport connected; handshake pending.
    pub fn link_connected(&self) {
        let mut state = self.link_state.lock();
        if *state == LinkState::Destroyed {
            return;
        }
        *state = LinkState::ConnectedUnsynchronized;
    }

    /// The synchronization handshake with this peer finished.
    pub fn synchronization_completed(&self) {
        {
            let mut state = self.link_state.lock();
            if *state == LinkState::Destroyed {
                return;
            }
            *state = LinkState::Synchronized;
        }
        self.synchronization_complete.store(true, Ordering::SeqCst);
        self.link_notify.notify_waiters();
        info!(peer = %self.address, "Queue system link established");
    }

    /// Wait until the link is established, up to `timeout`.
    pub async fn wait_for_link_established(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_link_established() {
                return true;
            }
            if self.link_state() == LinkState::Destroyed {
                return false;
            }
            let notified = self.link_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_link_established() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_link_established();
            }
        }
    }

    /// The transport link to this peer was lost. Pending outbound commands
    /// are cancelled with a delivery failure report so the queue manager
    /// can requeue them; synchronization state is cleared.
    pub async fn destination_link_lost(&self) {
        {
            let mut state = self.link_state.lock();
            if *state == LinkState::Destroyed {
                return;
            }
            *state = LinkState::Disconnected;
        }
        self.synchronization_complete.store(false, Ordering::SeqCst);
        self.expected_remote_in_queue_length.store(0, Ordering::SeqCst);

        if self.dispatcher_tx.send(DispatcherMsg::LinkLost).await.is_err() {
            debug!(peer = %self.address, "Dispatcher already stopped");
        }
        warn!(peer = %self.address, "Queue system link lost");
    }

    /// Terminal: stops both worker loops.
    pub async fn destination_destroyed(&self) {
        *self.link_state.lock() = LinkState::Destroyed;
        self.synchronization_complete.store(false, Ordering::SeqCst);
        self.link_notify.notify_waiters();
        let _ = self.dispatcher_tx.send(DispatcherMsg::Destroy).await;
        let _ = self.handler_tx.send(HandlerMsg::Destroy).await;
    }

    // ------------------------------------------------------------------
    // Sequential command funnels
    // ------------------------------------------------------------------

    /// Enqueue an outbound command on the sequential dispatcher. If the
    /// FIFO is full or gone, falls back to delivering on a detached task
    /// rather than dropping the command. Callers may hold manager locks
    /// that the delivery report needs, so the fallback must not run
    /// inline.
    pub async fn dispatch_command(
        self: &Arc<Self>,
        command: QueueSystemCommand,
        manager: &Arc<QueueManager>,
        transport: &Arc<dyn MessageTransport>,
    ) {
        match self.dispatcher_tx.try_send(DispatcherMsg::Command(command)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(DispatcherMsg::Command(command)))
            | Err(mpsc::error::TrySendError::Closed(DispatcherMsg::Command(command))) => {
                warn!(
                    peer = %self.address,
                    command = %command,
                    "Dispatcher queue unavailable, delivering out of band"
                );
                let destination = Arc::clone(self);
                let manager = Arc::clone(manager);
                let transport = Arc::clone(transport);
                tokio::spawn(async move {
                    deliver_command(&destination, &manager, &transport, command).await;
                });
            }
            Err(_) => {}
        }
    }

    /// Enqueue an inbound command on the sequential handler. Falls back to
    /// handling synchronously when the FIFO is full or gone.
    pub async fn handle_inbound_command(
        &self,
        command: QueueSystemCommand,
        manager: &Arc<QueueManager>,
    ) {
        match self.handler_tx.try_send(HandlerMsg::Command(command)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(HandlerMsg::Command(command)))
            | Err(mpsc::error::TrySendError::Closed(HandlerMsg::Command(command))) => {
                warn!(
                    peer = %self.address,
                    command = %command,
                    "Handler queue unavailable, handling synchronously"
                );
                manager.queue_system_command_received(command).await;
            }
            Err(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Flow control
    // ------------------------------------------------------------------

    pub fn remote_meta_data(&self) -> QueueSystemMetaData {
        self.meta_data.lock().clone()
    }

    /// Apply a metadata update from the peer.
    ///
    /// Merge rule: an update without extra properties patches only the
    /// queue-status fields into the existing record; an update carrying
    /// extra properties replaces the record wholesale. Either way the
    /// local length estimate is reset from the authoritative value.
    pub fn remote_meta_data_updated(&self, incoming: QueueSystemMetaData) {
        self.expected_remote_in_queue_length
            .store(incoming.in_queue_length as i64, Ordering::SeqCst);

        let mut current = self.meta_data.lock();
        if incoming.has_extra_data() {
            *current = incoming;
        } else {
            current.in_queue_length = incoming.in_queue_length;
            current.in_queue_max_length = incoming.in_queue_max_length;
            current.in_queue_blocked = incoming.in_queue_blocked;
        }
    }

    pub fn expected_remote_in_queue_length(&self) -> i64 {
        self.expected_remote_in_queue_length.load(Ordering::SeqCst)
    }

    /// Optimistic increment, one per dispatched item.
    pub fn increment_expected_remote_in_queue_length(&self) {
        self.expected_remote_in_queue_length
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Fail-safe: full when no link is established.
    pub fn is_expected_remote_in_queue_full(&self) -> bool {
        if !self.is_link_established() {
            return true;
        }
        match self.meta_data.lock().in_queue_max_length {
            Some(max) => self.expected_remote_in_queue_length() >= max as i64,
            None => false,
        }
    }

    /// Fail-safe: full when no link is established.
    pub fn is_remote_in_queue_full(&self) -> bool {
        if !self.is_link_established() {
            return true;
        }
        let meta = self.meta_data.lock();
        match meta.in_queue_max_length {
            Some(max) => meta.in_queue_length >= max,
            None => false,
        }
    }

    /// Fail-safe: blocked when no link is established.
    pub fn is_remote_in_queue_blocked(&self) -> bool {
        if !self.is_link_established() {
            return true;
        }
        self.meta_data.lock().in_queue_blocked
    }

    /// After the remote in-queue filled up, dispatch resumes only once the
    /// estimate has drained below max_length - refill_delta.
    pub fn has_dispatch_headroom(&self, refill_delta: u64) -> bool {
        if !self.is_link_established() {
            return false;
        }
        if self.is_remote_in_queue_blocked() {
            return false;
        }
        match self.meta_data.lock().in_queue_max_length {
            Some(max) => {
                let threshold = max.saturating_sub(refill_delta);
                self.expected_remote_in_queue_length() < threshold as i64
            }
            None => true,
        }
    }
}

/// Sequential outbound loop: commands leave for this peer strictly in the
/// order they were issued, and every command gets a delivery report.
async fn run_dispatcher(
    destination: Arc<RemoteQueueSystemDestination>,
    manager: Arc<QueueManager>,
    transport: Arc<dyn MessageTransport>,
    mut rx: mpsc::Receiver<DispatcherMsg>,
) {
    debug!(peer = %destination.address, "Destination dispatcher started");

    while let Some(msg) = rx.recv().await {
        match msg {
            DispatcherMsg::Command(command) => {
                deliver_command(&destination, &manager, &transport, command).await;
            }
            DispatcherMsg::LinkLost => {
                // Cancel everything queued behind the lost link.
                let mut cancelled = 0u32;
                while let Ok(msg) = rx.try_recv() {
                    match msg {
                        DispatcherMsg::Command(command) => {
                            cancelled += 1;
                            manager.command_delivery_report(command, false).await;
                        }
                        DispatcherMsg::Destroy => {
                            rx.close();
                        }
                        DispatcherMsg::LinkLost => {}
                    }
                }
                if cancelled > 0 {
                    warn!(
                        peer = %destination.address,
                        cancelled,
                        "Cancelled pending commands after link loss"
                    );
                }
            }
            DispatcherMsg::Destroy => break,
        }
    }

    // Report failure for anything still queued at shutdown.
    while let Ok(msg) = rx.try_recv() {
        if let DispatcherMsg::Command(command) = msg {
            manager.command_delivery_report(command, false).await;
        }
    }
    debug!(peer = %destination.address, "Destination dispatcher stopped");
}

async fn deliver_command(
    destination: &RemoteQueueSystemDestination,
    manager: &Arc<QueueManager>,
    transport: &Arc<dyn MessageTransport>,
    command: QueueSystemCommand,
) {
    if destination.link_state() == LinkState::Disconnected
        || destination.link_state() == LinkState::Destroyed
    {
        manager.command_delivery_report(command, false).await;
        return;
    }

    let frame = match rq_protocol::encode(&command) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(peer = %destination.address, command = %command, error = %e, "Failed to encode command");
            manager.command_delivery_report(command, false).await;
            return;
        }
    };

    match transport.send(&destination.address, frame).await {
        Ok(()) => {
            metrics::counter!("rq_commands_sent").increment(1);
            manager.command_delivery_report(command, true).await;
        }
        Err(e) => {
            debug!(peer = %destination.address, command = %command, error = %e, "Command send failed");
            metrics::counter!("rq_command_send_failures").increment(1);
            manager.command_delivery_report(command, false).await;
        }
    }
}

/// Sequential inbound loop: commands from this peer are applied strictly
/// in receipt order, one at a time.
async fn run_handler(
    manager: Arc<QueueManager>,
    mut rx: mpsc::Receiver<HandlerMsg>,
    peer: EndpointAddress,
) {
    debug!(peer = %peer, "Destination handler started");
    while let Some(msg) = rx.recv().await {
        match msg {
            HandlerMsg::Command(command) => {
                manager.queue_system_command_received(command).await;
            }
            HandlerMsg::Destroy => break,
        }
    }
    debug!(peer = %peer, "Destination handler stopped");
}
