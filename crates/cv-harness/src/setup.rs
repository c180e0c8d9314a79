//! Harness wiring

use std::sync::Arc;

use cv_adapters::{
    AggregateRepository, MemoryCheckpointStore, MemoryDeadLetterStore, MemoryEventStore,
    MemoryFlowStore, MemoryIdempotencyStore, MemoryInboxStore, MemoryOutboxStore,
    MemorySnapshotStore, StaticClusterCoordinator,
};
use cv_domain::CvResult;
use cv_flow::FlowEngine;
use cv_mediator::behaviors::LoggingBehavior;
use cv_mediator::Mediator;

use crate::orders::{
    CreateOrderCommand, CreateOrderHandler, GetOrderHandler, GetOrderQuery, OrderRepository,
    PayOrderCommand, ShipOrderCommand, OrderTransitionHandler,
};

/// One fully wired Convoy node: in-memory stores, the order handlers behind
/// a logging pipeline, a cluster coordinator, and a flow engine bound to the
/// same mediator.
pub struct ConvoyHarness {
    pub event_store: Arc<MemoryEventStore>,
    pub snapshots: Arc<MemorySnapshotStore>,
    pub outbox: Arc<MemoryOutboxStore>,
    pub inbox: Arc<MemoryInboxStore>,
    pub dead_letters: Arc<MemoryDeadLetterStore>,
    pub idempotency: Arc<MemoryIdempotencyStore>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub flow_store: Arc<MemoryFlowStore>,
    pub coordinator: Arc<StaticClusterCoordinator>,
    pub repository: Arc<OrderRepository>,
    pub mediator: Arc<Mediator>,
}

impl ConvoyHarness {
    pub fn new() -> CvResult<Self> {
        let event_store = Arc::new(MemoryEventStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let outbox = Arc::new(MemoryOutboxStore::new());
        let inbox = Arc::new(MemoryInboxStore::new());
        let dead_letters = Arc::new(MemoryDeadLetterStore::new());
        let idempotency = Arc::new(MemoryIdempotencyStore::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let flow_store = Arc::new(MemoryFlowStore::new());
        let coordinator = Arc::new(StaticClusterCoordinator::single_node());

        let repository = Arc::new(
            AggregateRepository::new(Arc::clone(&event_store), Arc::clone(&snapshots))
                .with_snapshot_every(10),
        );

        let mediator = Arc::new(
            Mediator::builder()
                .register_behavior(LoggingBehavior)
                .register_request_handler::<CreateOrderCommand, _>(CreateOrderHandler::new(
                    Arc::clone(&event_store),
                    Arc::clone(&outbox),
                ))
                .register_request_handler::<PayOrderCommand, _>(OrderTransitionHandler::new(
                    Arc::clone(&repository),
                ))
                .register_request_handler::<ShipOrderCommand, _>(OrderTransitionHandler::new(
                    Arc::clone(&repository),
                ))
                .register_request_handler::<GetOrderQuery, _>(GetOrderHandler::new(Arc::clone(
                    &repository,
                )))
                .build()?,
        );

        Ok(Self {
            event_store,
            snapshots,
            outbox,
            inbox,
            dead_letters,
            idempotency,
            checkpoints,
            flow_store,
            coordinator,
            repository,
            mediator,
        })
    }

    /// Flow engine bound to this harness's mediator and flow store.
    pub fn flow_engine(&self) -> FlowEngine<MemoryFlowStore> {
        FlowEngine::new(Arc::clone(&self.flow_store)).with_mediator(Arc::clone(&self.mediator))
    }
}
