use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use pharmaflow_core::{CustomerId, LotId, OrderId, ProductId, SellerId, WarehouseId};
use pharmaflow_infra::ledger::ProductStock;
use pharmaflow_infra::reservation::wire::StockRequest;
use pharmaflow_inventory::{InventoryLot, LotView, StockTotals};
use pharmaflow_orders::{Order, OrderLine, OrderStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct UpsertProductRequest {
    pub product_id: String,
    pub name: String,
    pub price: u64,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReceiveLotRequest {
    /// Generated when absent.
    pub lot_id: Option<LotId>,
    pub product_id: String,
    pub quantity: u32,
    pub expiration_date: NaiveDate,
    pub warehouse_id: Option<String>,
    pub aisle: Option<String>,
    pub shelf: Option<String>,
    #[serde(default)]
    pub requires_cold_chain: bool,
}

impl ReceiveLotRequest {
    pub fn into_lot(self) -> Result<InventoryLot, String> {
        let product_id = ProductId::parse(self.product_id).map_err(|e| e.to_string())?;
        let warehouse_id = parse_optional::<WarehouseId>(self.warehouse_id)?;
        Ok(InventoryLot::new(
            self.lot_id.unwrap_or_default(),
            product_id,
            self.quantity,
            self.expiration_date,
        )
        .at_location(warehouse_id, self.aisle, self.shelf)
        .cold_chain(self.requires_cold_chain))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Option<String>,
    pub seller_id: Option<String>,
    pub delivery_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetCustomerRequest {
    pub customer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AddLineRequest {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLineRequest {
    pub quantity: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrderListQuery {
    pub seller_id: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveryListQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Turn a stock request body into ledger lines, rejecting blank product ids.
pub fn stock_lines(body: &StockRequest) -> Result<Vec<(ProductId, u32)>, String> {
    if body.items.is_empty() {
        return Err("items must not be empty".to_string());
    }
    body.items
        .iter()
        .map(|item| {
            if item.product_id.as_str().trim().is_empty() {
                return Err("product_id must not be blank".to_string());
            }
            Ok((item.product_id.clone(), item.quantity))
        })
        .collect()
}

pub fn parse_optional<T>(raw: Option<String>) -> Result<Option<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|v| v.parse::<T>().map_err(|e| e.to_string()))
        .transpose()
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: OrderId,
    pub customer_id: Option<CustomerId>,
    pub seller_id: Option<SellerId>,
    pub delivery_address: Option<String>,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub total: u64,
    pub version: u64,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        use pharmaflow_core::AggregateRoot;

        Self {
            id: order.id_typed(),
            customer_id: order.customer_id().cloned(),
            seller_id: order.seller_id().cloned(),
            delivery_address: order.delivery_address().map(str::to_string),
            status: order.status(),
            lines: order.lines().to_vec(),
            total: order.total(),
            version: order.version(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub product_id: ProductId,
    pub total_available: u64,
    pub total_reserved: u64,
    pub lots: Vec<LotView>,
}

impl AvailabilityResponse {
    pub fn new(product_id: ProductId, lots: Vec<LotView>) -> Self {
        let totals = StockTotals::of(&lots);
        Self {
            product_id,
            total_available: totals.available,
            total_reserved: totals.reserved,
            lots,
        }
    }
}

impl From<ProductStock> for AvailabilityResponse {
    fn from(stock: ProductStock) -> Self {
        Self {
            product_id: stock.product_id,
            total_available: stock.totals.available,
            total_reserved: stock.totals.reserved,
            lots: stock.lots,
        }
    }
}
