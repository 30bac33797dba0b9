//! Cross-service integration events and their broker wire format.
//!
//! On the wire every message is
//!
//! ```text
//! { "eventType": "OrderConfirmed", "data": { ... } }
//! ```
//!
//! with ids as strings and timestamps/dates as ISO-8601. The set of variants
//! is closed: anything else decodes to [`Decoded::Unknown`] so listeners can
//! log and drop it instead of retrying forever.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use pharmaflow_core::{CustomerId, LotId, OrderId, ProductId, SellerId, WarehouseId};

/// One order line as carried by `OrderConfirmed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedLine {
    pub line_id: u32,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: u64,
}

/// Product + quantity pair used by events that only move stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineQuantity {
    pub product_id: ProductId,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub seller_id: Option<SellerId>,
    pub customer_id: CustomerId,
    pub delivery_address: Option<String>,
    pub lines: Vec<ConfirmedLine>,
    pub total: u64,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDelivered {
    pub order_id: OrderId,
    pub lines: Vec<LineQuantity>,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: OrderId,
    /// Whether stock had been reserved for the order before it was cancelled.
    pub was_confirmed: bool,
    pub lines: Vec<LineQuantity>,
    pub cancelled_at: DateTime<Utc>,
}

/// Upstream stock assignment: a new lot landed in a warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryAssigned {
    pub lot_id: LotId,
    pub product_id: ProductId,
    pub warehouse_id: Option<WarehouseId>,
    #[serde(default)]
    pub aisle: Option<String>,
    #[serde(default)]
    pub shelf: Option<String>,
    pub quantity: u32,
    pub expiration_date: NaiveDate,
    #[serde(default)]
    pub requires_cold_chain: bool,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockChangeKind {
    Received,
    Reserved,
    Released,
    Debited,
    Removed,
}

/// Per-product stock movement, rebroadcast to real-time observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryChanged {
    pub product_id: ProductId,
    pub change: StockChangeKind,
    pub quantity: u32,
    pub total_available: u64,
    pub total_reserved: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Every event type the broker boundary understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "data")]
pub enum IntegrationEvent {
    OrderConfirmed(OrderConfirmed),
    OrderDelivered(OrderDelivered),
    OrderCancelled(OrderCancelled),
    InventoryAssigned(InventoryAssigned),
    InventoryChanged(InventoryChanged),
}

/// Fieldless mirror of [`IntegrationEvent`], used as a handler routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrderConfirmed,
    OrderDelivered,
    OrderCancelled,
    InventoryAssigned,
    InventoryChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::OrderConfirmed,
        EventKind::OrderDelivered,
        EventKind::OrderCancelled,
        EventKind::InventoryAssigned,
        EventKind::InventoryChanged,
    ];

    /// The `eventType` discriminator on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::OrderConfirmed => "OrderConfirmed",
            EventKind::OrderDelivered => "OrderDelivered",
            EventKind::OrderCancelled => "OrderCancelled",
            EventKind::InventoryAssigned => "InventoryAssigned",
            EventKind::InventoryChanged => "InventoryChanged",
        }
    }

    pub fn from_wire(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == event_type)
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IntegrationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            IntegrationEvent::OrderConfirmed(_) => EventKind::OrderConfirmed,
            IntegrationEvent::OrderDelivered(_) => EventKind::OrderDelivered,
            IntegrationEvent::OrderCancelled(_) => EventKind::OrderCancelled,
            IntegrationEvent::InventoryAssigned(_) => EventKind::InventoryAssigned,
            IntegrationEvent::InventoryChanged(_) => EventKind::InventoryChanged,
        }
    }

    /// Serialize into the `{eventType, data}` wire envelope.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        serde_json::to_vec(self).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Decode a broker payload.
    ///
    /// Unknown discriminators are not an error: they come back as
    /// [`Decoded::Unknown`]. A known discriminator with a payload that does
    /// not fit is [`DecodeError::Malformed`].
    pub fn decode(bytes: &[u8]) -> Result<Decoded, DecodeError> {
        let raw: RawMessage =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::NotAnEnvelope(e.to_string()))?;

        if EventKind::from_wire(&raw.event_type).is_none() {
            return Ok(Decoded::Unknown {
                event_type: raw.event_type,
            });
        }

        let wire = serde_json::json!({ "eventType": raw.event_type, "data": raw.data });
        serde_json::from_value::<IntegrationEvent>(wire)
            .map(Decoded::Known)
            .map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(default)]
    data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Known(IntegrationEvent),
    Unknown { event_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not JSON, or no `eventType` field.
    #[error("payload is not an event envelope: {0}")]
    NotAnEnvelope(String),
    /// Known `eventType`, but `data` does not match its schema.
    #[error("malformed event payload: {0}")]
    Malformed(String),
}
