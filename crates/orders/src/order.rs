use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pharmaflow_core::{Aggregate, AggregateRoot, CustomerId, DomainError, OrderId, ProductId, SellerId};
use pharmaflow_events::{ConfirmedLine, Event, IntegrationEvent, LineQuantity};

use crate::diagnostics::ConfirmRejection;

/// Order status lifecycle.
///
/// `draft -> confirmed -> in_transit -> delivered`, one way; `cancelled` is
/// reachable from `draft` and `confirmed` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    Confirmed,
    InTransit,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::InTransit => "in_transit",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(OrderStatus::Draft),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "in_transit" => Ok(OrderStatus::InTransit),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown order state `{other}`"))),
        }
    }
}

/// Order line. `product_name` and `unit_price` are copied from the catalog
/// when the line is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line_id: u32,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price: u64,
}

impl OrderLine {
    pub fn subtotal(&self) -> u64 {
        u64::from(self.quantity).saturating_mul(self.unit_price)
    }
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    customer_id: Option<CustomerId>,
    seller_id: Option<SellerId>,
    delivery_address: Option<String>,
    status: OrderStatus,
    lines: Vec<OrderLine>,
    total: u64,
    next_line_id: u32,
    version: u64,
    created: bool,
}

impl Order {
    /// Stream type recorded on every stored order event.
    pub const AGGREGATE_TYPE: &'static str = "orders.order";

    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            customer_id: None,
            seller_id: None,
            delivery_address: None,
            status: OrderStatus::Draft,
            lines: Vec::new(),
            total: 0,
            next_line_id: 1,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn customer_id(&self) -> Option<&CustomerId> {
        self.customer_id.as_ref()
    }

    pub fn seller_id(&self) -> Option<&SellerId> {
        self.seller_id.as_ref()
    }

    pub fn delivery_address(&self) -> Option<&str> {
        self.delivery_address.as_deref()
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn line(&self, line_id: u32) -> Option<&OrderLine> {
        self.lines.iter().find(|l| l.line_id == line_id)
    }

    /// Always equal to the sum of line subtotals.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_modifiable(&self) -> bool {
        matches!(self.status, OrderStatus::Draft)
    }

    /// Local confirmation preconditions. Stock is checked separately.
    pub fn check_confirmable(&self) -> Result<(), ConfirmRejection> {
        if self.status != OrderStatus::Draft {
            return Err(ConfirmRejection::NotDraft);
        }
        if self.lines.is_empty() {
            return Err(ConfirmRejection::NoItems);
        }
        if self.customer_id.is_none() {
            return Err(ConfirmRejection::MissingCustomer);
        }
        Ok(())
    }

    fn recompute_total(&mut self) {
        self.total = self
            .lines
            .iter()
            .fold(0u64, |acc, l| acc.saturating_add(l.subtotal()));
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub customer_id: Option<CustomerId>,
    pub seller_id: Option<SellerId>,
    pub delivery_address: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetCustomer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCustomer {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine. Merges into the existing line for the same product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateLineQuantity. A quantity of 0 removes the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLineQuantity {
    pub order_id: OrderId,
    pub line_id: u32,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveLine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLine {
    pub order_id: OrderId,
    pub line_id: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmOrder.
///
/// Only dispatched once stock has been reserved for every line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkInTransit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInTransit {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkDelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkDelivered {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    CreateOrder(CreateOrder),
    SetCustomer(SetCustomer),
    AddLine(AddLine),
    UpdateLineQuantity(UpdateLineQuantity),
    RemoveLine(RemoveLine),
    ConfirmOrder(ConfirmOrder),
    MarkInTransit(MarkInTransit),
    MarkDelivered(MarkDelivered),
    CancelOrder(CancelOrder),
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub customer_id: Option<CustomerId>,
    pub seller_id: Option<SellerId>,
    pub delivery_address: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CustomerAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerAssigned {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemAdded (audit).
///
/// When `line_id` already exists, `quantity` is added to that line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub order_id: OrderId,
    pub line_id: u32,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemQuantityUpdated (audit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuantityUpdated {
    pub order_id: OrderId,
    pub line_id: u32,
    pub product_id: ProductId,
    pub previous_quantity: u32,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemRemoved (audit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRemoved {
    pub order_id: OrderId,
    pub line_id: u32,
    pub product_id: ProductId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmed. Carries the full line set and total at confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub seller_id: Option<SellerId>,
    pub delivery_address: Option<String>,
    pub lines: Vec<OrderLine>,
    pub total: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderInTransit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInTransit {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderDelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDelivered {
    pub order_id: OrderId,
    pub lines: Vec<OrderLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub previous_status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderCreated(OrderCreated),
    CustomerAssigned(CustomerAssigned),
    ItemAdded(ItemAdded),
    ItemQuantityUpdated(ItemQuantityUpdated),
    ItemRemoved(ItemRemoved),
    OrderConfirmed(OrderConfirmed),
    OrderInTransit(OrderInTransit),
    OrderDelivered(OrderDelivered),
    OrderCancelled(OrderCancelled),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "orders.order.created",
            OrderEvent::CustomerAssigned(_) => "orders.order.customer_assigned",
            OrderEvent::ItemAdded(_) => "orders.order.item_added",
            OrderEvent::ItemQuantityUpdated(_) => "orders.order.item_quantity_updated",
            OrderEvent::ItemRemoved(_) => "orders.order.item_removed",
            OrderEvent::OrderConfirmed(_) => "orders.order.confirmed",
            OrderEvent::OrderInTransit(_) => "orders.order.in_transit",
            OrderEvent::OrderDelivered(_) => "orders.order.delivered",
            OrderEvent::OrderCancelled(_) => "orders.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(e) => e.occurred_at,
            OrderEvent::CustomerAssigned(e) => e.occurred_at,
            OrderEvent::ItemAdded(e) => e.occurred_at,
            OrderEvent::ItemQuantityUpdated(e) => e.occurred_at,
            OrderEvent::ItemRemoved(e) => e.occurred_at,
            OrderEvent::OrderConfirmed(e) => e.occurred_at,
            OrderEvent::OrderInTransit(e) => e.occurred_at,
            OrderEvent::OrderDelivered(e) => e.occurred_at,
            OrderEvent::OrderCancelled(e) => e.occurred_at,
        }
    }
}

impl OrderEvent {
    /// The cross-service counterpart of this event, if it has one.
    ///
    /// Line edits and creation stay local; confirmation, delivery and
    /// cancellation are choreographed with logistics and inventory.
    pub fn to_integration(&self) -> Option<IntegrationEvent> {
        match self {
            OrderEvent::OrderConfirmed(e) => Some(IntegrationEvent::OrderConfirmed(
                pharmaflow_events::OrderConfirmed {
                    order_id: e.order_id,
                    seller_id: e.seller_id.clone(),
                    customer_id: e.customer_id.clone(),
                    delivery_address: e.delivery_address.clone(),
                    lines: e
                        .lines
                        .iter()
                        .map(|l| ConfirmedLine {
                            line_id: l.line_id,
                            product_id: l.product_id.clone(),
                            product_name: l.product_name.clone(),
                            quantity: l.quantity,
                            unit_price: l.unit_price,
                        })
                        .collect(),
                    total: e.total,
                    confirmed_at: e.occurred_at,
                },
            )),
            OrderEvent::OrderDelivered(e) => Some(IntegrationEvent::OrderDelivered(
                pharmaflow_events::OrderDelivered {
                    order_id: e.order_id,
                    lines: line_quantities(&e.lines),
                    delivered_at: e.occurred_at,
                },
            )),
            OrderEvent::OrderCancelled(e) => Some(IntegrationEvent::OrderCancelled(
                pharmaflow_events::OrderCancelled {
                    order_id: e.order_id,
                    was_confirmed: e.previous_status == OrderStatus::Confirmed,
                    lines: line_quantities(&e.lines),
                    cancelled_at: e.occurred_at,
                },
            )),
            _ => None,
        }
    }
}

fn line_quantities(lines: &[OrderLine]) -> Vec<LineQuantity> {
    lines
        .iter()
        .map(|l| LineQuantity {
            product_id: l.product_id.clone(),
            quantity: l.quantity,
        })
        .collect()
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderCreated(e) => {
                self.id = e.order_id;
                self.customer_id = e.customer_id.clone();
                self.seller_id = e.seller_id.clone();
                self.delivery_address = e.delivery_address.clone();
                self.status = OrderStatus::Draft;
                self.lines.clear();
                self.next_line_id = 1;
                self.created = true;
            }
            OrderEvent::CustomerAssigned(e) => {
                self.customer_id = Some(e.customer_id.clone());
            }
            OrderEvent::ItemAdded(e) => {
                match self.lines.iter_mut().find(|l| l.line_id == e.line_id) {
                    Some(line) => line.quantity = line.quantity.saturating_add(e.quantity),
                    None => {
                        self.lines.push(OrderLine {
                            line_id: e.line_id,
                            product_id: e.product_id.clone(),
                            product_name: e.product_name.clone(),
                            quantity: e.quantity,
                            unit_price: e.unit_price,
                        });
                        self.next_line_id = self.next_line_id.max(e.line_id + 1);
                    }
                }
            }
            OrderEvent::ItemQuantityUpdated(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.line_id == e.line_id) {
                    line.quantity = e.quantity;
                }
            }
            OrderEvent::ItemRemoved(e) => {
                self.lines.retain(|l| l.line_id != e.line_id);
            }
            OrderEvent::OrderConfirmed(_) => {
                self.status = OrderStatus::Confirmed;
            }
            OrderEvent::OrderInTransit(_) => {
                self.status = OrderStatus::InTransit;
            }
            OrderEvent::OrderDelivered(_) => {
                self.status = OrderStatus::Delivered;
            }
            OrderEvent::OrderCancelled(_) => {
                self.status = OrderStatus::Cancelled;
            }
        }

        self.recompute_total();

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            OrderCommand::SetCustomer(cmd) => self.handle_set_customer(cmd),
            OrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            OrderCommand::UpdateLineQuantity(cmd) => self.handle_update_quantity(cmd),
            OrderCommand::RemoveLine(cmd) => self.handle_remove_line(cmd),
            OrderCommand::ConfirmOrder(cmd) => self.handle_confirm(cmd),
            OrderCommand::MarkInTransit(cmd) => self.handle_mark_in_transit(cmd),
            OrderCommand::MarkDelivered(cmd) => self.handle_mark_delivered(cmd),
            OrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Order {
    fn ensure_existing(&self, order_id: OrderId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_modifiable(&self) -> Result<(), DomainError> {
        if !self.is_modifiable() {
            return Err(DomainError::invariant(format!(
                "order lines can only change while draft (order is {})",
                self.status
            )));
        }
        Ok(())
    }

    fn existing_line(&self, line_id: u32) -> Result<&OrderLine, DomainError> {
        self.line(line_id)
            .ok_or_else(|| DomainError::validation(format!("line {line_id} does not exist")))
    }

    fn ensure_status(&self, required: OrderStatus, action: &str) -> Result<(), DomainError> {
        if self.status != required {
            return Err(DomainError::invariant(format!(
                "cannot {action}: order is {}, expected {required}",
                self.status
            )));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }

        Ok(vec![OrderEvent::OrderCreated(OrderCreated {
            order_id: cmd.order_id,
            customer_id: cmd.customer_id.clone(),
            seller_id: cmd.seller_id.clone(),
            delivery_address: cmd.delivery_address.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_customer(&self, cmd: &SetCustomer) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_modifiable()?;

        Ok(vec![OrderEvent::CustomerAssigned(CustomerAssigned {
            order_id: cmd.order_id,
            customer_id: cmd.customer_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_modifiable()?;

        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let event = match self.lines.iter().find(|l| l.product_id == cmd.product_id) {
            Some(existing) => {
                if existing.quantity.checked_add(cmd.quantity).is_none() {
                    return Err(DomainError::validation("line quantity overflow"));
                }
                ItemAdded {
                    order_id: cmd.order_id,
                    line_id: existing.line_id,
                    product_id: existing.product_id.clone(),
                    product_name: existing.product_name.clone(),
                    quantity: cmd.quantity,
                    unit_price: existing.unit_price,
                    occurred_at: cmd.occurred_at,
                }
            }
            None => {
                if cmd.product_name.trim().is_empty() {
                    return Err(DomainError::validation("product_name cannot be empty"));
                }
                ItemAdded {
                    order_id: cmd.order_id,
                    line_id: self.next_line_id,
                    product_id: cmd.product_id.clone(),
                    product_name: cmd.product_name.clone(),
                    quantity: cmd.quantity,
                    unit_price: cmd.unit_price,
                    occurred_at: cmd.occurred_at,
                }
            }
        };

        Ok(vec![OrderEvent::ItemAdded(event)])
    }

    fn handle_update_quantity(
        &self,
        cmd: &UpdateLineQuantity,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_modifiable()?;
        let line = self.existing_line(cmd.line_id)?;

        if cmd.quantity == 0 {
            return Ok(vec![OrderEvent::ItemRemoved(ItemRemoved {
                order_id: cmd.order_id,
                line_id: line.line_id,
                product_id: line.product_id.clone(),
                quantity: line.quantity,
                occurred_at: cmd.occurred_at,
            })]);
        }

        Ok(vec![OrderEvent::ItemQuantityUpdated(ItemQuantityUpdated {
            order_id: cmd.order_id,
            line_id: line.line_id,
            product_id: line.product_id.clone(),
            previous_quantity: line.quantity,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_line(&self, cmd: &RemoveLine) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_modifiable()?;
        let line = self.existing_line(cmd.line_id)?;

        Ok(vec![OrderEvent::ItemRemoved(ItemRemoved {
            order_id: cmd.order_id,
            line_id: line.line_id,
            product_id: line.product_id.clone(),
            quantity: line.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;

        self.check_confirmable().map_err(|rejection| match rejection {
            ConfirmRejection::NotDraft => DomainError::invariant(rejection.to_string()),
            ConfirmRejection::NoItems | ConfirmRejection::MissingCustomer => {
                DomainError::validation(rejection.to_string())
            }
        })?;

        let customer_id = self
            .customer_id
            .clone()
            .ok_or_else(|| DomainError::validation(ConfirmRejection::MissingCustomer.to_string()))?;

        Ok(vec![OrderEvent::OrderConfirmed(OrderConfirmed {
            order_id: cmd.order_id,
            customer_id,
            seller_id: self.seller_id.clone(),
            delivery_address: self.delivery_address.clone(),
            lines: self.lines.clone(),
            total: self.total,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_in_transit(&self, cmd: &MarkInTransit) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_status(OrderStatus::Confirmed, "mark in transit")?;

        Ok(vec![OrderEvent::OrderInTransit(OrderInTransit {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_delivered(&self, cmd: &MarkDelivered) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_status(OrderStatus::InTransit, "mark delivered")?;

        Ok(vec![OrderEvent::OrderDelivered(OrderDelivered {
            order_id: cmd.order_id,
            lines: self.lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;

        if !matches!(self.status, OrderStatus::Draft | OrderStatus::Confirmed) {
            return Err(DomainError::invariant(format!(
                "cannot cancel: order is {}",
                self.status
            )));
        }

        Ok(vec![OrderEvent::OrderCancelled(OrderCancelled {
            order_id: cmd.order_id,
            previous_status: self.status,
            lines: self.lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_order_id() -> OrderId {
        OrderId::new()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn run(order: &mut Order, command: OrderCommand) -> Result<Vec<OrderEvent>, DomainError> {
        let events = order.handle(&command)?;
        for e in &events {
            order.apply(e);
        }
        Ok(events)
    }

    fn created(order_id: OrderId, customer: Option<&str>) -> Order {
        let mut order = Order::empty(order_id);
        run(
            &mut order,
            OrderCommand::CreateOrder(CreateOrder {
                order_id,
                customer_id: customer.map(CustomerId::from),
                seller_id: Some(SellerId::from("S1")),
                delivery_address: Some("Rua das Flores 12".to_string()),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        order
    }

    fn add_line(order_id: OrderId, product: &str, quantity: u32, unit_price: u64) -> OrderCommand {
        OrderCommand::AddLine(AddLine {
            order_id,
            product_id: ProductId::from(product),
            product_name: format!("{product} name"),
            quantity,
            unit_price,
            occurred_at: test_time(),
        })
    }

    fn confirm(order_id: OrderId) -> OrderCommand {
        OrderCommand::ConfirmOrder(ConfirmOrder {
            order_id,
            occurred_at: test_time(),
        })
    }

    #[test]
    fn create_order_emits_order_created_event() {
        let order_id = test_order_id();
        let order = Order::empty(order_id);
        let events = order
            .handle(&OrderCommand::CreateOrder(CreateOrder {
                order_id,
                customer_id: Some(CustomerId::from("C1")),
                seller_id: None,
                delivery_address: None,
                occurred_at: test_time(),
            }))
            .unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            OrderEvent::OrderCreated(e) => {
                assert_eq!(e.order_id, order_id);
                assert_eq!(e.customer_id, Some(CustomerId::from("C1")));
            }
            _ => panic!("Expected OrderCreated event"),
        }
    }

    #[test]
    fn adding_same_product_twice_merges_quantities() {
        let order_id = test_order_id();
        let mut order = created(order_id, Some("C1"));

        run(&mut order, add_line(order_id, "P1", 2, 100)).unwrap();
        run(&mut order, add_line(order_id, "P2", 1, 50)).unwrap();
        run(&mut order, add_line(order_id, "P1", 3, 100)).unwrap();

        assert_eq!(order.lines().len(), 2);
        assert_eq!(order.lines()[0].quantity, 5);
        assert_eq!(order.total(), 5 * 100 + 50);
    }

    #[test]
    fn update_to_zero_removes_the_line() {
        let order_id = test_order_id();
        let mut order = created(order_id, Some("C1"));
        run(&mut order, add_line(order_id, "P1", 2, 100)).unwrap();

        let events = run(
            &mut order,
            OrderCommand::UpdateLineQuantity(UpdateLineQuantity {
                order_id,
                line_id: 1,
                quantity: 0,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert!(matches!(events[0], OrderEvent::ItemRemoved(_)));
        assert!(order.lines().is_empty());
        assert_eq!(order.total(), 0);
    }

    #[test]
    fn removed_line_ids_are_not_reused() {
        let order_id = test_order_id();
        let mut order = created(order_id, Some("C1"));
        run(&mut order, add_line(order_id, "P1", 1, 10)).unwrap();
        run(
            &mut order,
            OrderCommand::RemoveLine(RemoveLine {
                order_id,
                line_id: 1,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        run(&mut order, add_line(order_id, "P2", 1, 10)).unwrap();

        assert_eq!(order.lines()[0].line_id, 2);
    }

    #[test]
    fn confirm_without_lines_is_rejected_and_stays_draft() {
        let order_id = test_order_id();
        let mut order = created(order_id, Some("C1"));

        assert_eq!(order.check_confirmable(), Err(ConfirmRejection::NoItems));
        let err = run(&mut order, confirm(order_id)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("without items")));
        assert_eq!(order.status(), OrderStatus::Draft);
    }

    #[test]
    fn confirm_requires_a_customer() {
        let order_id = test_order_id();
        let mut order = created(order_id, None);
        run(&mut order, add_line(order_id, "P1", 1, 10)).unwrap();

        assert_eq!(
            order.check_confirmable(),
            Err(ConfirmRejection::MissingCustomer)
        );

        run(
            &mut order,
            OrderCommand::SetCustomer(SetCustomer {
                order_id,
                customer_id: CustomerId::from("C9"),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.check_confirmable(), Ok(()));
    }

    #[test]
    fn confirm_emits_exactly_one_event_with_lines_and_total() {
        let order_id = test_order_id();
        let mut order = created(order_id, Some("C1"));
        run(&mut order, add_line(order_id, "P1", 2, 150)).unwrap();
        run(&mut order, add_line(order_id, "P2", 4, 25)).unwrap();

        let events = run(&mut order, confirm(order_id)).unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            OrderEvent::OrderConfirmed(e) => {
                assert_eq!(e.lines, order.lines());
                assert_eq!(e.total, 2 * 150 + 4 * 25);
                assert_eq!(e.customer_id, CustomerId::from("C1"));
                assert_eq!(e.seller_id, Some(SellerId::from("S1")));
            }
            _ => panic!("Expected OrderConfirmed event"),
        }
        assert_eq!(order.status(), OrderStatus::Confirmed);
    }

    #[test]
    fn cannot_modify_confirmed_order() {
        let order_id = test_order_id();
        let mut order = created(order_id, Some("C1"));
        run(&mut order, add_line(order_id, "P1", 1, 100)).unwrap();
        run(&mut order, confirm(order_id)).unwrap();

        let err = run(&mut order, add_line(order_id, "P2", 1, 100)).unwrap_err();
        match err {
            DomainError::InvariantViolation(msg) if msg.contains("only change while draft") => {}
            _ => panic!("Expected InvariantViolation for modifying confirmed order"),
        }
    }

    #[test]
    fn transitions_are_one_way() {
        let order_id = test_order_id();
        let mut order = created(order_id, Some("C1"));
        run(&mut order, add_line(order_id, "P1", 1, 100)).unwrap();

        let deliver = OrderCommand::MarkDelivered(MarkDelivered {
            order_id,
            occurred_at: test_time(),
        });
        let in_transit = OrderCommand::MarkInTransit(MarkInTransit {
            order_id,
            occurred_at: test_time(),
        });

        assert!(run(&mut order, in_transit.clone()).is_err());
        run(&mut order, confirm(order_id)).unwrap();
        assert!(run(&mut order, deliver.clone()).is_err());
        run(&mut order, in_transit.clone()).unwrap();
        run(&mut order, deliver.clone()).unwrap();
        assert_eq!(order.status(), OrderStatus::Delivered);

        assert!(run(&mut order, in_transit).is_err());
        assert!(run(&mut order, confirm(order_id)).is_err());
    }

    #[test]
    fn cancel_only_from_draft_or_confirmed() {
        let cancel = |order_id| {
            OrderCommand::CancelOrder(CancelOrder {
                order_id,
                occurred_at: test_time(),
            })
        };

        let order_id = test_order_id();
        let mut order = created(order_id, Some("C1"));
        run(&mut order, add_line(order_id, "P1", 1, 100)).unwrap();
        run(&mut order, confirm(order_id)).unwrap();
        let events = run(&mut order, cancel(order_id)).unwrap();
        match &events[0] {
            OrderEvent::OrderCancelled(e) => assert_eq!(e.previous_status, OrderStatus::Confirmed),
            _ => panic!("Expected OrderCancelled event"),
        }

        let other = test_order_id();
        let mut shipped = created(other, Some("C1"));
        run(&mut shipped, add_line(other, "P1", 1, 100)).unwrap();
        run(&mut shipped, confirm(other)).unwrap();
        run(
            &mut shipped,
            OrderCommand::MarkInTransit(MarkInTransit {
                order_id: other,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert!(run(&mut shipped, cancel(other)).is_err());
    }

    #[test]
    fn only_choreographed_events_have_integration_counterparts() {
        let order_id = test_order_id();
        let mut order = created(order_id, Some("C1"));
        let added = run(&mut order, add_line(order_id, "P1", 3, 100)).unwrap();
        assert!(added[0].to_integration().is_none());

        let confirmed = run(&mut order, confirm(order_id)).unwrap();
        match confirmed[0].to_integration() {
            Some(IntegrationEvent::OrderConfirmed(e)) => {
                assert_eq!(e.order_id, order_id);
                assert_eq!(e.lines.len(), 1);
                assert_eq!(e.lines[0].quantity, 3);
                assert_eq!(e.total, 300);
            }
            other => panic!("Expected integration OrderConfirmed, got {other:?}"),
        }
    }

    #[test]
    fn version_increments_on_apply() {
        let order_id = test_order_id();
        assert_eq!(Order::empty(order_id).version(), 0);

        let mut order = created(order_id, Some("C1"));
        assert_eq!(order.version(), 1);
        run(&mut order, add_line(order_id, "P1", 1, 1)).unwrap();
        assert_eq!(order.version(), 2);
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let order_id = test_order_id();
        let order = created(order_id, Some("C1"));
        let before = order.clone();

        let cmd = add_line(order_id, "P1", 1, 100);
        let events1 = order.handle(&cmd).unwrap();
        let events2 = order.handle(&cmd).unwrap();

        assert_eq!(order, before);
        assert_eq!(events1, events2);
    }

    proptest! {
        #[test]
        fn total_is_always_sum_of_subtotals(
            adds in proptest::collection::vec((0usize..4, 1u32..50, 1u64..10_000), 1..20),
        ) {
            let products = ["P1", "P2", "P3", "P4"];
            let order_id = test_order_id();
            let mut order = created(order_id, Some("C1"));
            for (p, q, price) in adds {
                run(&mut order, add_line(order_id, products[p], q, price)).unwrap();
            }

            let expected: u64 = order.lines().iter().map(OrderLine::subtotal).sum();
            prop_assert_eq!(order.total(), expected);

            let mut seen = std::collections::HashSet::new();
            for line in order.lines() {
                prop_assert!(seen.insert(line.product_id.clone()));
            }
        }
    }
}
