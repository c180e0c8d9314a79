//! Order sample domain
//!
//! Small but real: commands route through the mediator, the aggregate is
//! rebuilt from its stream, created orders co-commit an outbox row, and a
//! projection folds the read model the queries answer from.

use std::sync::Arc;

use cv_adapters::{
    append_with_outbox, AggregateRepository, MemoryEventStore, MemoryOutboxStore,
    MemorySnapshotStore,
};
use cv_domain::{
    Aggregate, CvResult, EventData, EventEnvelope, MediatorError, Message, Request,
};
use cv_mediator::{DispatchContext, RequestHandler};
use cv_ports::{ExpectedVersion, Projection, ProjectionApplyError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Commands and queries
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderCommand {
    pub customer: String,
    pub amount: i64,
}

impl Message for CreateOrderCommand {
    fn name() -> &'static str {
        "CreateOrderCommand"
    }
}

impl Request for CreateOrderCommand {
    /// The freshly assigned order id.
    type Response = String;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayOrderCommand {
    pub order_id: String,
}

impl Message for PayOrderCommand {
    fn name() -> &'static str {
        "PayOrderCommand"
    }
}

impl Request for PayOrderCommand {
    type Response = ();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipOrderCommand {
    pub order_id: String,
}

impl Message for ShipOrderCommand {
    fn name() -> &'static str {
        "ShipOrderCommand"
    }
}

impl Request for ShipOrderCommand {
    type Response = ();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOrderQuery {
    pub order_id: String,
}

impl Message for GetOrderQuery {
    fn name() -> &'static str {
        "GetOrderQuery"
    }
}

impl Request for GetOrderQuery {
    type Response = OrderView;
}

/// Read model answered by [`GetOrderQuery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: String,
    pub customer: String,
    pub status: String,
    pub amount: i64,
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
    Created { customer: String, amount: i64 },
    Paid,
    Shipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Paid,
    Shipped,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "Created",
            OrderStatus::Paid => "Paid",
            OrderStatus::Shipped => "Shipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub customer: String,
    pub amount: i64,
    pub status: OrderStatus,
}

impl Aggregate for Order {
    type Event = OrderEvent;

    fn type_name() -> &'static str {
        "Order"
    }

    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn event_type(event: &Self::Event) -> &'static str {
        match event {
            OrderEvent::Created { .. } => "OrderCreatedEvent",
            OrderEvent::Paid => "OrderPaidEvent",
            OrderEvent::Shipped => "OrderShippedEvent",
        }
    }

    fn apply(state: Option<Self>, event: Self::Event) -> CvResult<Self> {
        match (state, event) {
            (None, OrderEvent::Created { customer, amount }) => Ok(Order {
                id: String::new(),
                customer,
                amount,
                status: OrderStatus::Created,
            }),
            (Some(mut order), OrderEvent::Paid) if order.status == OrderStatus::Created => {
                order.status = OrderStatus::Paid;
                Ok(order)
            }
            (Some(mut order), OrderEvent::Shipped) if order.status == OrderStatus::Paid => {
                order.status = OrderStatus::Shipped;
                Ok(order)
            }
            (state, event) => Err(MediatorError::validation(format!(
                "order cannot apply {:?} in state {:?}",
                event,
                state.map(|o| o.status)
            ))),
        }
    }
}

pub type OrderRepository = AggregateRepository<Order, MemoryEventStore, MemorySnapshotStore>;

// ============================================================================
// Handlers
// ============================================================================

/// Creates the stream and co-commits the outbox row in one unit of work.
pub struct CreateOrderHandler {
    event_store: Arc<MemoryEventStore>,
    outbox: Arc<MemoryOutboxStore>,
}

impl CreateOrderHandler {
    pub fn new(event_store: Arc<MemoryEventStore>, outbox: Arc<MemoryOutboxStore>) -> Self {
        Self { event_store, outbox }
    }
}

impl RequestHandler<CreateOrderCommand> for CreateOrderHandler {
    async fn handle(
        &self,
        request: CreateOrderCommand,
        ctx: &DispatchContext,
    ) -> CvResult<String> {
        if request.amount <= 0 {
            return Err(MediatorError::validation(format!(
                "order amount must be positive, got {}",
                request.amount
            )));
        }

        let order_id = ctx.message_id.to_string();
        let stream_id = Order::stream_id(&order_id);
        let event = OrderEvent::Created {
            customer: request.customer,
            amount: request.amount,
        };
        let data = EventData::encode(Order::event_type(&event), &event)
            .map_err(|e| MediatorError::fatal(format!("unencodable order event: {e}")))?;

        append_with_outbox(
            &*self.event_store,
            &*self.outbox,
            &stream_id,
            vec![data],
            ExpectedVersion::Exact(0),
        )
        .await?;

        Ok(order_id)
    }
}

/// Replays the aggregate, applies a transition event, appends at the
/// expected version.
pub struct OrderTransitionHandler {
    repository: Arc<OrderRepository>,
}

impl OrderTransitionHandler {
    pub fn new(repository: Arc<OrderRepository>) -> Self {
        Self { repository }
    }

    async fn transition(&self, order_id: &str, event: OrderEvent) -> CvResult<()> {
        let (order, version) = self
            .repository
            .load(order_id)
            .await?
            .ok_or_else(|| MediatorError::not_found(format!("order {order_id} not found")))?;

        let next = Order::apply(Some(order), event.clone())?;
        self.repository
            .save(order_id, &next, vec![event], version)
            .await?;
        Ok(())
    }
}

impl RequestHandler<PayOrderCommand> for OrderTransitionHandler {
    async fn handle(&self, request: PayOrderCommand, _ctx: &DispatchContext) -> CvResult<()> {
        self.transition(&request.order_id, OrderEvent::Paid).await
    }
}

impl RequestHandler<ShipOrderCommand> for OrderTransitionHandler {
    async fn handle(&self, request: ShipOrderCommand, _ctx: &DispatchContext) -> CvResult<()> {
        self.transition(&request.order_id, OrderEvent::Shipped).await
    }
}

/// Answers from the stream fold.
pub struct GetOrderHandler {
    repository: Arc<OrderRepository>,
}

impl GetOrderHandler {
    pub fn new(repository: Arc<OrderRepository>) -> Self {
        Self { repository }
    }
}

impl RequestHandler<GetOrderQuery> for GetOrderHandler {
    async fn handle(&self, request: GetOrderQuery, _ctx: &DispatchContext) -> CvResult<OrderView> {
        let (order, _version) = self
            .repository
            .load(&request.order_id)
            .await?
            .ok_or_else(|| {
                MediatorError::not_found(format!("order {} not found", request.order_id))
            })?;

        Ok(OrderView {
            order_id: request.order_id,
            customer: order.customer,
            status: order.status.as_str().to_string(),
            amount: order.amount,
        })
    }
}

// ============================================================================
// Projection
// ============================================================================

/// Order read model folded from `Order-*` streams.
#[derive(Debug, Clone, Default)]
pub struct OrderSummaryProjection {
    pub orders: HashMap<String, OrderView>,
}

impl Projection for OrderSummaryProjection {
    fn name(&self) -> &str {
        "order-summaries"
    }

    fn stream_pattern(&self) -> &str {
        "Order-*"
    }

    fn apply(&mut self, envelope: &EventEnvelope) -> Result<(), ProjectionApplyError> {
        let order_id = envelope
            .stream_id
            .strip_prefix("Order-")
            .unwrap_or(&envelope.stream_id)
            .to_string();
        let event: OrderEvent =
            envelope
                .payload_as()
                .map_err(|e| ProjectionApplyError::Apply {
                    projection: self.name().to_string(),
                    event_type: envelope.event_type.clone(),
                    message: e.to_string(),
                })?;

        match event {
            OrderEvent::Created { customer, amount } => {
                self.orders.insert(
                    order_id.clone(),
                    OrderView {
                        order_id,
                        customer,
                        status: OrderStatus::Created.as_str().to_string(),
                        amount,
                    },
                );
            }
            OrderEvent::Paid => {
                if let Some(view) = self.orders.get_mut(&order_id) {
                    view.status = OrderStatus::Paid.as_str().to_string();
                }
            }
            OrderEvent::Shipped => {
                if let Some(view) = self.orders.get_mut(&order_id) {
                    view.status = OrderStatus::Shipped.as_str().to_string();
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.orders.clear();
    }
}
