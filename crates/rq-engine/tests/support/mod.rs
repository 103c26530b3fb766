#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;

use rq_common::{EndpointAddress, ItemData, QueueItem};
use rq_config::AppConfig;
use rq_engine::{InProcessNetwork, QueueController, QueueManager};
use rq_queue::{NullQueueStorage, QueueStorage};

/// Controller callback observed during a test.
#[derive(Debug, Clone)]
pub enum Event {
    NewInItem(QueueItem),
    OutDoneSuccess(String, Option<serde_json::Value>),
    OutDoneFailure(String),
    OutDoneCancelled(String),
    OutRelocationRequired(String),
    UnableToDispatch(String),
    UnableToDispatchQueueFull(String),
    CancelInItem(String),
    LinkEstablished(EndpointAddress),
    LinkLost(EndpointAddress),
}

/// Records every controller callback on an unbounded channel.
pub struct RecordingController {
    events: mpsc::UnboundedSender<Event>,
}

impl RecordingController {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events: tx }), rx)
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl QueueController for RecordingController {
    async fn new_in_item(&self, item: QueueItem) {
        self.emit(Event::NewInItem(item));
    }

    async fn out_item_done_success(
        &self,
        item: QueueItem,
        response_data: Option<serde_json::Value>,
    ) {
        self.emit(Event::OutDoneSuccess(item.id, response_data));
    }

    async fn out_item_done_failure(
        &self,
        item: QueueItem,
        _response_data: Option<serde_json::Value>,
    ) {
        self.emit(Event::OutDoneFailure(item.id));
    }

    async fn out_item_done_cancelled(&self, item: QueueItem) {
        self.emit(Event::OutDoneCancelled(item.id));
    }

    async fn out_item_relocation_required(&self, item: QueueItem) {
        self.emit(Event::OutRelocationRequired(item.id));
    }

    async fn unable_to_dispatch_out_item(&self, item: QueueItem) {
        self.emit(Event::UnableToDispatch(item.id));
    }

    async fn unable_to_dispatch_out_item_queue_full(&self, item: QueueItem) {
        self.emit(Event::UnableToDispatchQueueFull(item.id));
    }

    async fn cancel_in_item(&self, item: QueueItem) {
        self.emit(Event::CancelInItem(item.id));
    }

    async fn link_established(&self, address: &EndpointAddress) {
        self.emit(Event::LinkEstablished(address.clone()));
    }

    async fn link_lost(&self, address: &EndpointAddress) {
        self.emit(Event::LinkLost(address.clone()));
    }
}

/// Middle hop of a chained topology: checks out every arriving in-item,
/// forwards it downstream as a child, and completes the parent with the
/// child's outcome. The manager back-reference is bound after construction
/// because the manager owns the controller.
pub struct RelayingController {
    manager: OnceLock<Arc<QueueManager>>,
    downstream: EndpointAddress,
    events: mpsc::UnboundedSender<Event>,
}

impl RelayingController {
    pub fn new(downstream: EndpointAddress) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                manager: OnceLock::new(),
                downstream,
                events: tx,
            }),
            rx,
        )
    }

    pub fn bind(&self, manager: Arc<QueueManager>) {
        let _ = self.manager.set(manager);
    }

    fn manager(&self) -> &Arc<QueueManager> {
        self.manager.get().expect("relay manager bound")
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    async fn complete_parent(
        &self,
        child: &QueueItem,
        success: bool,
        response_data: Option<serde_json::Value>,
    ) {
        let manager = self.manager();
        let parent_id = child
            .parent_id
            .as_deref()
            .expect("relayed child carries its parent id");
        let parent = manager
            .get_in_item(parent_id)
            .await
            .expect("parent still held while child in flight");
        let result = if success {
            manager.in_item_done_success(&parent, response_data).await
        } else {
            manager.in_item_done_failure(&parent, response_data).await
        };
        result.expect("parent completion");
    }
}

#[async_trait]
impl QueueController for RelayingController {
    async fn new_in_item(&self, item: QueueItem) {
        self.emit(Event::NewInItem(item.clone()));
        let manager = self.manager();
        assert!(manager.check_out(&item.id).await.expect("relay checkout"));
        manager
            .dispatch_queue_item_relay(&item, self.downstream.clone())
            .await
            .expect("relay dispatch");
    }

    async fn out_item_done_success(
        &self,
        item: QueueItem,
        response_data: Option<serde_json::Value>,
    ) {
        self.emit(Event::OutDoneSuccess(item.id.clone(), response_data.clone()));
        self.complete_parent(&item, true, response_data).await;
    }

    async fn out_item_done_failure(
        &self,
        item: QueueItem,
        response_data: Option<serde_json::Value>,
    ) {
        self.emit(Event::OutDoneFailure(item.id.clone()));
        self.complete_parent(&item, false, response_data).await;
    }

    async fn out_item_done_cancelled(&self, item: QueueItem) {
        self.emit(Event::OutDoneCancelled(item.id.clone()));
        let manager = self.manager();
        if let Some(parent_id) = item.parent_id.as_deref() {
            if let Some(parent) = manager.get_in_item(parent_id).await {
                manager
                    .in_item_done_cancelled(&parent)
                    .await
                    .expect("parent cancellation");
            }
        }
    }

    async fn out_item_relocation_required(&self, item: QueueItem) {
        self.emit(Event::OutRelocationRequired(item.id.clone()));
        self.complete_parent(&item, false, None).await;
    }

    async fn unable_to_dispatch_out_item(&self, item: QueueItem) {
        self.emit(Event::UnableToDispatch(item.id.clone()));
        self.complete_parent(&item, false, None).await;
    }

    async fn unable_to_dispatch_out_item_queue_full(&self, item: QueueItem) {
        self.emit(Event::UnableToDispatchQueueFull(item.id.clone()));
        self.complete_parent(&item, false, None).await;
    }

    async fn cancel_in_item(&self, item: QueueItem) {
        self.emit(Event::CancelInItem(item.id));
    }

    async fn link_established(&self, address: &EndpointAddress) {
        self.emit(Event::LinkEstablished(address.clone()));
    }

    async fn link_lost(&self, address: &EndpointAddress) {
        self.emit(Event::LinkLost(address.clone()));
    }
}

/// Start a node whose controller relays every in-item to `downstream`.
pub async fn start_relay_node(
    network: &Arc<InProcessNetwork>,
    name: &str,
    downstream: EndpointAddress,
) -> (Arc<QueueManager>, mpsc::UnboundedReceiver<Event>) {
    let config = test_config(name);
    let transport = network.register(config.node.name.clone());
    let (controller, events) = RelayingController::new(downstream);
    let manager = QueueManager::new(
        config,
        Arc::clone(&controller) as Arc<dyn QueueController>,
        transport,
        Arc::new(NullQueueStorage),
        Arc::new(NullQueueStorage),
    );
    controller.bind(Arc::clone(&manager));
    manager.start().await.expect("relay start");
    (manager, events)
}

pub fn test_config(name: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.node.name = name.to_string();
    config.queue.storage = "none".to_string();
    config.engine.check_interval_ms = 100;
    config.engine.startup_sync_timeout_ms = 2_000;
    config
}

pub async fn start_node(
    network: &Arc<InProcessNetwork>,
    name: &str,
) -> (Arc<QueueManager>, mpsc::UnboundedReceiver<Event>) {
    start_node_with(
        network,
        test_config(name),
        Arc::new(NullQueueStorage),
        Arc::new(NullQueueStorage),
    )
    .await
}

pub async fn start_node_with(
    network: &Arc<InProcessNetwork>,
    config: AppConfig,
    in_storage: Arc<dyn QueueStorage>,
    out_storage: Arc<dyn QueueStorage>,
) -> (Arc<QueueManager>, mpsc::UnboundedReceiver<Event>) {
    let transport = network.register(config.node.name.clone());
    let (controller, events) = RecordingController::new();
    let manager = QueueManager::new(config, controller, transport, in_storage, out_storage);
    manager.start().await.expect("manager start");
    (manager, events)
}

/// Connect two nodes and wait until the synchronization handshake has
/// completed in both directions.
pub async fn connect_and_sync(
    network: &Arc<InProcessNetwork>,
    a: &Arc<QueueManager>,
    b: &Arc<QueueManager>,
) {
    network.connect(a.local_address(), b.local_address()).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if a.collaboration().is_link_established(b.local_address())
            && b.collaboration().is_link_established(a.local_address())
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "link between {} and {} never established",
            a.local_address(),
            b.local_address()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn payload(description: &str) -> ItemData {
    ItemData::new(description, serde_json::json!({ "description": description }))
}

/// Next controller event, with a test-failure timeout.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for controller event")
        .expect("controller event channel closed")
}

/// Skip events until one matches the predicate.
pub async fn wait_for_event<F>(rx: &mut mpsc::UnboundedReceiver<Event>, mut matches: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if matches(&event) {
            return event;
        }
    }
}
