//! relayq demo: three queue systems in one process.
//!
//! A sender dispatches work items to a relay, the relay forwards each item
//! to a receiver as a child item, and completion responses travel the whole
//! chain back. Links are established over the in-process transport, so the
//! demo exercises dispatch, relaying, back-pressure metadata and the
//! synchronization handshake without any external infrastructure.
//!
//! Environment:
//! - `RELAYQ_CONFIG` / standard search paths for the TOML configuration
//! - `RELAYQ_DEMO_ITEMS` number of items the sender dispatches (default 10)
//! - `RUST_LOG`, `LOG_FORMAT` as usual

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use rq_common::{ItemData, QueueItem};
use rq_config::{AppConfig, ConfigLoader};
use rq_engine::{InProcessNetwork, QueueController, QueueManager, RedispatchQueue};
use rq_queue::{NullQueueStorage, QueueStorage, SqliteQueueStorage};

#[tokio::main]
async fn main() -> Result<()> {
    rq_common::logging::init_logging();
    info!("Starting relayq demo node");

    let base_config = ConfigLoader::new().load().unwrap_or_else(|e| {
        warn!(error = %e, "No usable configuration found, using defaults");
        AppConfig::default()
    });

    let network = InProcessNetwork::new();

    // Three queue systems sharing one process and one transport hub.
    let sender = start_system(&network, &base_config, "sender", SenderController::new()).await?;
    let relay = start_system(&network, &base_config, "relay", RelayController::new("receiver")).await?;
    let receiver = start_system(&network, &base_config, "receiver", ReceiverController::new()).await?;

    network.connect(sender.manager.local_address(), relay.manager.local_address()).await;
    network.connect(relay.manager.local_address(), receiver.manager.local_address()).await;

    let sync_timeout = Duration::from_millis(base_config.engine.startup_sync_timeout_ms);
    for system in [&sender, &relay, &receiver] {
        if !system.manager.wait_for_startup_synchronization(sync_timeout).await {
            warn!(node = %system.manager.local_address(), "Peers not fully synchronized, continuing anyway");
        }
    }

    let item_count: u32 = std::env::var("RELAYQ_DEMO_ITEMS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);

    info!(item_count, "Dispatching demo work items");
    for n in 0..item_count {
        let data = ItemData::new(
            format!("demo-item-{}", n),
            serde_json::json!({ "sequence": n }),
        );
        sender
            .manager
            .dispatch_queue_item(data, relay.manager.local_address().clone())
            .await
            .context("demo dispatch failed")?;
    }

    info!("Demo running; press Ctrl-C to stop");
    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    for system in [&sender, &relay, &receiver] {
        system.manager.shutdown().await;
    }
    Ok(())
}

struct QueueSystem {
    manager: Arc<QueueManager>,
}

/// Build a queue system named `name` on the shared in-process network.
async fn start_system(
    network: &Arc<InProcessNetwork>,
    base_config: &AppConfig,
    name: &str,
    controller: Arc<dyn BoundController>,
) -> Result<QueueSystem> {
    let mut config = base_config.clone();
    config.node.name = name.to_string();
    config
        .validate()
        .with_context(|| format!("invalid configuration for {}", name))?;

    let transport = network.register(name);
    let in_storage = build_storage(&config, name, "in").await?;
    let out_storage = build_storage(&config, name, "out").await?;

    let manager = QueueManager::new(
        config,
        controller.clone().as_queue_controller(),
        transport,
        in_storage,
        out_storage,
    );
    controller.bind(Arc::clone(&manager));
    manager
        .start()
        .await
        .with_context(|| format!("failed to start queue system {}", name))?;

    Ok(QueueSystem { manager })
}

async fn build_storage(
    config: &AppConfig,
    node: &str,
    which: &str,
) -> Result<Arc<dyn QueueStorage>> {
    match config.queue.storage.as_str() {
        "sqlite" => {
            std::fs::create_dir_all(&config.node.data_dir)
                .with_context(|| format!("failed to create {}", config.node.data_dir))?;
            let path = format!("{}/{}.db", config.node.data_dir, node);
            let storage = SqliteQueueStorage::connect(&path, format!("{}-{}", node, which))
                .await
                .with_context(|| format!("failed to open queue database {}", path))?;
            Ok(Arc::new(storage))
        }
        _ => Ok(Arc::new(NullQueueStorage)),
    }
}

/// A controller that receives its manager reference after construction.
/// The manager owns the controller, so the back-reference is set once the
/// manager exists.
trait BoundController: QueueController + Send + Sync + 'static {
    fn bind(&self, manager: Arc<QueueManager>);
    fn as_queue_controller(self: Arc<Self>) -> Arc<dyn QueueController>;
}

fn bound_manager(cell: &OnceLock<Arc<QueueManager>>) -> Option<&Arc<QueueManager>> {
    let manager = cell.get();
    if manager.is_none() {
        error!("Controller used before its manager was bound");
    }
    manager
}

// ----------------------------------------------------------------------
// Sender: originates work, retries failed dispatches.
// ----------------------------------------------------------------------

struct SenderController {
    manager: OnceLock<Arc<QueueManager>>,
    redispatch: OnceLock<Arc<RedispatchQueue>>,
}

impl SenderController {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            manager: OnceLock::new(),
            redispatch: OnceLock::new(),
        })
    }
}

impl BoundController for SenderController {
    fn bind(&self, manager: Arc<QueueManager>) {
        let _ = self.manager.set(Arc::clone(&manager));
    }

    fn as_queue_controller(self: Arc<Self>) -> Arc<dyn QueueController> {
        self
    }
}

#[async_trait]
impl QueueController for SenderController {
    async fn new_in_item(&self, item: QueueItem) {
        warn!(item_id = %item.id, "Sender received unexpected in-item");
    }

    async fn out_item_done_success(&self, item: QueueItem, response_data: Option<serde_json::Value>) {
        info!(
            item_id = %item.id,
            description = %item.item_data.description,
            response = ?response_data,
            "Work item completed"
        );
    }

    async fn out_item_done_failure(&self, item: QueueItem, response_data: Option<serde_json::Value>) {
        warn!(item_id = %item.id, response = ?response_data, "Work item failed remotely");
    }

    async fn out_item_done_cancelled(&self, item: QueueItem) {
        info!(item_id = %item.id, "Work item cancelled");
    }

    async fn out_item_relocation_required(&self, item: QueueItem) {
        // Single-destination demo: retry against the same relay.
        self.unable_to_dispatch_out_item(item).await;
    }

    async fn unable_to_dispatch_out_item(&self, item: QueueItem) {
        let Some(manager) = bound_manager(&self.manager) else {
            return;
        };
        let Some(address) = item.sender_receiver_address.clone() else {
            warn!(item_id = %item.id, "Undispatchable item has no destination, dropping");
            return;
        };
        let redispatch = self.redispatch.get_or_init(|| {
            let queue = RedispatchQueue::new(address.clone());
            queue.start(Arc::clone(manager), Duration::from_millis(250), 5);
            queue
        });
        info!(item_id = %item.id, peer = %address, "Parking item for redispatch");
        redispatch.push(item);
    }
}

// ----------------------------------------------------------------------
// Relay: forwards every received item downstream as a child item and
// completes the parent when the child completes.
// ----------------------------------------------------------------------

struct RelayController {
    manager: OnceLock<Arc<QueueManager>>,
    downstream: String,
}

impl RelayController {
    fn new(downstream: &str) -> Arc<Self> {
        Arc::new(Self {
            manager: OnceLock::new(),
            downstream: downstream.to_string(),
        })
    }

    async fn complete_parent(&self, child: &QueueItem, outcome: Outcome) {
        let Some(manager) = bound_manager(&self.manager) else {
            return;
        };
        let Some(parent_id) = child.parent_id.as_deref() else {
            warn!(item_id = %child.id, "Completed child has no parent");
            return;
        };
        let Some(parent) = manager.get_in_item(parent_id).await else {
            warn!(parent_id, "Parent of completed child no longer held");
            return;
        };
        let result = match outcome {
            Outcome::Success(data) => manager.in_item_done_success(&parent, data).await,
            Outcome::Failure(data) => manager.in_item_done_failure(&parent, data).await,
            Outcome::Cancelled => manager.in_item_done_cancelled(&parent).await,
        };
        if let Err(e) = result {
            error!(parent_id, error = %e, "Failed to complete relayed item");
        }
    }
}

enum Outcome {
    Success(Option<serde_json::Value>),
    Failure(Option<serde_json::Value>),
    Cancelled,
}

impl BoundController for RelayController {
    fn bind(&self, manager: Arc<QueueManager>) {
        let _ = self.manager.set(manager);
    }

    fn as_queue_controller(self: Arc<Self>) -> Arc<dyn QueueController> {
        self
    }
}

#[async_trait]
impl QueueController for RelayController {
    async fn new_in_item(&self, item: QueueItem) {
        let Some(manager) = bound_manager(&self.manager) else {
            return;
        };
        if let Err(e) = manager.check_out(&item.id).await {
            error!(item_id = %item.id, error = %e, "Relay checkout failed");
            return;
        }
        let downstream = rq_common::EndpointAddress::new(self.downstream.clone());
        match manager.dispatch_queue_item_relay(&item, downstream).await {
            Ok(child_id) => {
                info!(item_id = %item.id, child_id = %child_id, "Item relayed downstream");
            }
            Err(e) => {
                error!(item_id = %item.id, error = %e, "Relay dispatch failed");
                let _ = manager.in_item_done_failure(&item, None).await;
            }
        }
    }

    async fn out_item_done_success(&self, item: QueueItem, response_data: Option<serde_json::Value>) {
        self.complete_parent(&item, Outcome::Success(response_data)).await;
    }

    async fn out_item_done_failure(&self, item: QueueItem, response_data: Option<serde_json::Value>) {
        self.complete_parent(&item, Outcome::Failure(response_data)).await;
    }

    async fn out_item_done_cancelled(&self, item: QueueItem) {
        self.complete_parent(&item, Outcome::Cancelled).await;
    }

    async fn out_item_relocation_required(&self, item: QueueItem) {
        // No alternate downstream in the demo; report failure upstream.
        self.complete_parent(&item, Outcome::Failure(None)).await;
    }

    async fn unable_to_dispatch_out_item(&self, item: QueueItem) {
        warn!(item_id = %item.id, "Relay could not forward item, failing the parent");
        self.complete_parent(&item, Outcome::Failure(None)).await;
    }
}

// ----------------------------------------------------------------------
// Receiver: consumes items and reports success.
// ----------------------------------------------------------------------

struct ReceiverController {
    manager: OnceLock<Arc<QueueManager>>,
}

impl ReceiverController {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            manager: OnceLock::new(),
        })
    }
}

impl BoundController for ReceiverController {
    fn bind(&self, manager: Arc<QueueManager>) {
        let _ = self.manager.set(manager);
    }

    fn as_queue_controller(self: Arc<Self>) -> Arc<dyn QueueController> {
        self
    }
}

#[async_trait]
impl QueueController for ReceiverController {
    async fn new_in_item(&self, item: QueueItem) {
        let Some(manager) = bound_manager(&self.manager) else {
            return;
        };
        if let Err(e) = manager.check_out(&item.id).await {
            error!(item_id = %item.id, error = %e, "Receiver checkout failed");
            return;
        }
        info!(
            item_id = %item.id,
            description = %item.item_data.description,
            "Processing item"
        );
        let response = serde_json::json!({ "processed": item.item_data.description });
        if let Err(e) = manager.in_item_done_success(&item, Some(response)).await {
            error!(item_id = %item.id, error = %e, "Failed to report completion");
        }
    }

    async fn out_item_done_success(&self, item: QueueItem, _response_data: Option<serde_json::Value>) {
        warn!(item_id = %item.id, "Receiver has no out-queue traffic");
    }

    async fn out_item_done_failure(&self, item: QueueItem, _response_data: Option<serde_json::Value>) {
        warn!(item_id = %item.id, "Receiver has no out-queue traffic");
    }

    async fn out_item_done_cancelled(&self, _item: QueueItem) {}

    async fn out_item_relocation_required(&self, _item: QueueItem) {}

    async fn unable_to_dispatch_out_item(&self, _item: QueueItem) {}
}
