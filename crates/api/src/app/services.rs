//! Service wiring: stores, ledger, broker, handlers and background workers.
//!
//! Everything the HTTP handlers need hangs off [`AppServices`], which the
//! router carries as an `Extension`. Broker subscriptions are opened while
//! building, so nothing published after that is lost, but the listener
//! threads only start in [`AppServices::start_workers`], once the caller has
//! bound its socket.

use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use pharmaflow_catalog::InMemoryCatalog;
use pharmaflow_core::{AggregateId, OrderId};
use pharmaflow_events::{EventDispatcher, EventEnvelope, EventKind, InMemoryEventBus};
use pharmaflow_logistics::Delivery;
use pharmaflow_orders::{Order, OrderCommand};

use pharmaflow_infra::broker::{
    Broker, BrokerChangePublisher, BrokerError, INVENTORY_TOPIC, InMemoryBroker, MessageSource,
    ORDERS_TOPIC,
};
use pharmaflow_infra::command_dispatcher::{CommandDispatcher, DispatchError};
use pharmaflow_infra::confirmation::OrderConfirmationService;
use pharmaflow_infra::event_store::{InMemoryEventStore, StoredEvent};
use pharmaflow_infra::fanout::FanOut;
use pharmaflow_infra::handlers::{
    BroadcastInventoryChanged, CancelDeliveryOnOrderCancelled, CreateDeliveryOnOrderConfirmed,
    DebitStockOnOrderDelivered, FinalizeDeliveryOnOrderDelivered, ReceiveStockOnInventoryAssigned,
    ReleaseStockOnOrderCancelled, ReserveStockOnOrderConfirmed,
};
use pharmaflow_infra::ledger::InMemoryLedger;
use pharmaflow_infra::logistics::DeliveryService;
use pharmaflow_infra::projections::{OrderReadModel, OrdersProjection};
use pharmaflow_infra::read_model::InMemoryReadStore;
use pharmaflow_infra::relay::OrderEventRelay;
use pharmaflow_infra::reservation::{
    HttpReservationClient, LocalReservationClient, ReservationClient, ReservationError,
};
use pharmaflow_infra::workers::{
    ListenerConfig, ListenerSupervisor, ProjectionWorker, WorkerHandle,
};

use crate::config::{AppConfig, BrokerKind};

pub type OrderBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub type OrderDispatcher = CommandDispatcher<Arc<InMemoryEventStore>, OrderBus>;
pub type OrdersReadModel = Arc<OrdersProjection<Arc<InMemoryReadStore<OrderId, OrderReadModel>>>>;
pub type DeliveryStore = Arc<InMemoryReadStore<OrderId, Delivery>>;

const DELIVERIES_SUBSCRIPTION: &str = "logistics.deliveries";
const RESERVATIONS_SUBSCRIPTION: &str = "inventory.reservations";
const INGEST_SUBSCRIPTION: &str = "inventory.ingest";
const OBSERVERS_SUBSCRIPTION: &str = "fanout.observers";

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("orders read model rebuild failed: {0}")]
    Rebuild(String),
    #[error("background workers already started")]
    AlreadyStarted,
}

struct PendingListener {
    source: Arc<dyn MessageSource>,
    handlers: Arc<EventDispatcher>,
}

pub struct AppServices {
    dispatcher: Arc<OrderDispatcher>,
    bus: OrderBus,
    broker: Arc<dyn Broker>,
    pub catalog: Arc<InMemoryCatalog>,
    pub ledger: Arc<InMemoryLedger>,
    /// Local ledger access for the inventory HTTP surface, whatever client
    /// order confirmation uses.
    pub stock: LocalReservationClient<Arc<InMemoryLedger>>,
    pub orders: OrdersReadModel,
    pub deliveries: DeliveryService<DeliveryStore, OrdersReadModel>,
    pub confirmation: OrderConfirmationService<Arc<InMemoryEventStore>, OrderBus>,
    pub fanout: Arc<FanOut>,
    listener_config: ListenerConfig,
    pending: Mutex<Option<Vec<PendingListener>>>,
}

/// Threads started by [`AppServices::start_workers`].
pub struct BackgroundWorkers {
    listeners: ListenerSupervisor,
    workers: Vec<WorkerHandle>,
}

impl BackgroundWorkers {
    pub fn listeners(&self) -> &ListenerSupervisor {
        &self.listeners
    }

    pub fn shutdown(self) {
        self.listeners.shutdown();
        for worker in self.workers {
            worker.shutdown();
        }
    }
}

pub fn build_services(config: &AppConfig) -> Result<AppServices, ServicesError> {
    let broker = connect_broker(config)?;

    let store = Arc::new(InMemoryEventStore::new());
    let bus: OrderBus = Arc::new(InMemoryEventBus::new());
    let dispatcher = Arc::new(CommandDispatcher::new(store, bus.clone()));

    let ledger = Arc::new(
        InMemoryLedger::new().with_publisher(Arc::new(BrokerChangePublisher::new(Arc::new(
            broker.clone(),
        )))),
    );
    let catalog = Arc::new(InMemoryCatalog::new());
    let fanout = Arc::new(FanOut::new(config.fanout));

    let orders: OrdersReadModel = Arc::new(OrdersProjection::new(Arc::new(InMemoryReadStore::new())));
    let delivery_store: DeliveryStore = Arc::new(InMemoryReadStore::new());

    let reservations: Arc<dyn ReservationClient> = match &config.inventory_service_url {
        Some(url) => {
            info!(inventory_service_url = %url, "reserving stock over HTTP");
            Arc::new(HttpReservationClient::new(url.clone(), config.reservation_timeout)?)
        }
        None => Arc::new(LocalReservationClient::new(ledger.clone())),
    };
    let confirmation =
        OrderConfirmationService::new(dispatcher.clone(), catalog.clone(), reservations);

    let mut deliveries = EventDispatcher::new();
    deliveries
        .register(
            EventKind::OrderConfirmed,
            Arc::new(CreateDeliveryOnOrderConfirmed::new(delivery_store.clone())),
        )
        .register(
            EventKind::OrderDelivered,
            Arc::new(FinalizeDeliveryOnOrderDelivered::new(delivery_store.clone())),
        )
        .register(
            EventKind::OrderCancelled,
            Arc::new(CancelDeliveryOnOrderCancelled::new(delivery_store.clone())),
        );

    let mut reservations = EventDispatcher::new();
    reservations
        .register(
            EventKind::OrderConfirmed,
            Arc::new(ReserveStockOnOrderConfirmed::new(ledger.clone())),
        )
        .register(
            EventKind::OrderCancelled,
            Arc::new(ReleaseStockOnOrderCancelled::new(ledger.clone())),
        )
        .register(
            EventKind::OrderDelivered,
            Arc::new(DebitStockOnOrderDelivered::new(ledger.clone())),
        );

    let mut ingest = EventDispatcher::new();
    ingest.register(
        EventKind::InventoryAssigned,
        Arc::new(ReceiveStockOnInventoryAssigned::new(ledger.clone())),
    );

    let mut observers = EventDispatcher::new();
    observers.register(
        EventKind::InventoryChanged,
        Arc::new(BroadcastInventoryChanged::new(fanout.clone())),
    );

    let mut pending = Vec::new();
    for (topic, subscription, handlers) in [
        (ORDERS_TOPIC, DELIVERIES_SUBSCRIPTION, deliveries),
        (ORDERS_TOPIC, RESERVATIONS_SUBSCRIPTION, reservations),
        (INVENTORY_TOPIC, INGEST_SUBSCRIPTION, ingest),
        (INVENTORY_TOPIC, OBSERVERS_SUBSCRIPTION, observers),
    ] {
        pending.push(PendingListener {
            source: broker.subscribe(topic, subscription)?,
            handlers: Arc::new(handlers),
        });
    }

    Ok(AppServices {
        deliveries: DeliveryService::new(delivery_store, orders.clone()),
        stock: LocalReservationClient::new(ledger.clone()),
        dispatcher,
        bus,
        broker,
        catalog,
        ledger,
        orders,
        confirmation,
        fanout,
        listener_config: ListenerConfig::default(),
        pending: Mutex::new(Some(pending)),
    })
}

fn connect_broker(config: &AppConfig) -> Result<Arc<dyn Broker>, ServicesError> {
    match config.broker {
        BrokerKind::Memory => Ok(Arc::new(InMemoryBroker::with_max_deliveries(
            config.max_deliveries,
        ))),
        BrokerKind::Redis => redis_broker(config),
    }
}

#[cfg(feature = "redis")]
fn redis_broker(config: &AppConfig) -> Result<Arc<dyn Broker>, ServicesError> {
    use pharmaflow_infra::broker::RedisStreamsBroker;

    info!(redis_url = %config.redis_url, "using Redis Streams broker");
    Ok(Arc::new(
        RedisStreamsBroker::new(&config.redis_url)?.with_max_deliveries(config.max_deliveries),
    ))
}

#[cfg(not(feature = "redis"))]
fn redis_broker(config: &AppConfig) -> Result<Arc<dyn Broker>, ServicesError> {
    warn!("BROKER=redis but the redis feature is not enabled, falling back to in-memory");
    Ok(Arc::new(InMemoryBroker::with_max_deliveries(
        config.max_deliveries,
    )))
}

impl AppServices {
    /// Rebuild the orders read model from the store, then start the order
    /// relay, the orders projection and one listener per broker subscription.
    /// Callable once, before requests are served.
    pub fn start_workers(&self) -> Result<BackgroundWorkers, ServicesError> {
        let pending = match self.pending.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or(ServicesError::AlreadyStarted)?;

        let history = self
            .dispatcher
            .store()
            .events_of_type(Order::AGGREGATE_TYPE)
            .map_err(|e| ServicesError::Rebuild(e.to_string()))?;
        self.orders
            .rebuild_from_scratch(&history)
            .map_err(|e| ServicesError::Rebuild(e.to_string()))?;

        let relay = OrderEventRelay::new(self.broker.clone());
        let projection = self.orders.clone();
        let workers = vec![
            ProjectionWorker::spawn(
                "order-relay",
                self.bus.clone(),
                move |env: EventEnvelope<JsonValue>| relay.forward(&env).map(|_| ()),
            )?,
            ProjectionWorker::spawn(
                "orders-projection",
                self.bus.clone(),
                move |env: EventEnvelope<JsonValue>| projection.apply_envelope(&env),
            )?,
        ];

        let mut listeners = ListenerSupervisor::new(self.listener_config.clone());
        for p in pending {
            listeners.spawn(p.source, p.handlers)?;
        }
        info!(listeners = listeners.len(), "background workers started");

        Ok(BackgroundWorkers { listeners, workers })
    }

    pub fn dispatch(
        &self,
        order_id: OrderId,
        command: OrderCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatcher
            .dispatch(order_id.into(), Order::AGGREGATE_TYPE, command, |id: AggregateId| {
                Order::empty(id.into())
            })
    }

    /// Current state from the event store (not the read model).
    pub fn load_order(&self, order_id: OrderId) -> Result<Option<Order>, DispatchError> {
        self.dispatcher
            .load(order_id.into(), |id: AggregateId| Order::empty(id.into()))
    }
}
