use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use pharmaflow_core::{Entity, LotId, ProductId, WarehouseId};
use pharmaflow_events::InventoryAssigned;

use crate::error::LedgerError;
use crate::view::LotView;

/// A batch of one product at one location, with its own expiry.
///
/// Counters only ever move through [`reserve`](Self::reserve),
/// [`release`](Self::release) and [`debit`](Self::debit), each of which checks
/// before it mutates, so neither counter can underflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLot {
    lot_id: LotId,
    product_id: ProductId,
    warehouse_id: Option<WarehouseId>,
    aisle: Option<String>,
    shelf: Option<String>,
    quantity_available: u32,
    quantity_reserved: u32,
    expiration_date: NaiveDate,
    requires_cold_chain: bool,
}

impl InventoryLot {
    /// A fresh, unassigned lot with everything available.
    pub fn new(
        lot_id: LotId,
        product_id: ProductId,
        quantity: u32,
        expiration_date: NaiveDate,
    ) -> Self {
        Self {
            lot_id,
            product_id,
            warehouse_id: None,
            aisle: None,
            shelf: None,
            quantity_available: quantity,
            quantity_reserved: 0,
            expiration_date,
            requires_cold_chain: false,
        }
    }

    pub fn at_location(
        mut self,
        warehouse_id: Option<WarehouseId>,
        aisle: Option<String>,
        shelf: Option<String>,
    ) -> Self {
        self.warehouse_id = warehouse_id;
        self.aisle = aisle;
        self.shelf = shelf;
        self
    }

    pub fn cold_chain(mut self, requires_cold_chain: bool) -> Self {
        self.requires_cold_chain = requires_cold_chain;
        self
    }

    pub fn from_assigned(event: &InventoryAssigned) -> Self {
        Self::new(
            event.lot_id,
            event.product_id.clone(),
            event.quantity,
            event.expiration_date,
        )
        .at_location(
            event.warehouse_id.clone(),
            event.aisle.clone(),
            event.shelf.clone(),
        )
        .cold_chain(event.requires_cold_chain)
    }

    pub fn lot_id(&self) -> LotId {
        self.lot_id
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn warehouse_id(&self) -> Option<&WarehouseId> {
        self.warehouse_id.as_ref()
    }

    pub fn quantity_available(&self) -> u32 {
        self.quantity_available
    }

    pub fn quantity_reserved(&self) -> u32 {
        self.quantity_reserved
    }

    pub fn expiration_date(&self) -> NaiveDate {
        self.expiration_date
    }

    pub fn requires_cold_chain(&self) -> bool {
        self.requires_cold_chain
    }

    /// Expired lots keep their counters but are never picked for new holds.
    pub fn is_expired_on(&self, today: NaiveDate) -> bool {
        self.expiration_date < today
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_on(Utc::now().date_naive())
    }

    /// available -> reserved
    pub fn reserve(&mut self, quantity: u32) -> Result<(), LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        if quantity > self.quantity_available {
            return Err(LedgerError::InsufficientStock {
                requested: u64::from(quantity),
                available: u64::from(self.quantity_available),
            });
        }
        self.quantity_available -= quantity;
        self.quantity_reserved += quantity;
        Ok(())
    }

    /// reserved -> available
    pub fn release(&mut self, quantity: u32) -> Result<(), LedgerError> {
        self.ensure_reserved(quantity)?;
        self.quantity_reserved -= quantity;
        self.quantity_available += quantity;
        Ok(())
    }

    /// reserved -> gone
    pub fn debit(&mut self, quantity: u32) -> Result<(), LedgerError> {
        self.ensure_reserved(quantity)?;
        self.quantity_reserved -= quantity;
        Ok(())
    }

    fn ensure_reserved(&self, quantity: u32) -> Result<(), LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        if quantity > self.quantity_reserved {
            return Err(LedgerError::InsufficientReservedStock {
                requested: u64::from(quantity),
                reserved: u64::from(self.quantity_reserved),
            });
        }
        Ok(())
    }

    pub fn view(&self) -> LotView {
        LotView {
            lot_id: self.lot_id,
            warehouse_id: self.warehouse_id.clone(),
            aisle: self.aisle.clone(),
            shelf: self.shelf.clone(),
            quantity_available: self.quantity_available,
            quantity_reserved: self.quantity_reserved,
            expiration_date: self.expiration_date,
            requires_cold_chain: self.requires_cold_chain,
        }
    }
}

impl Entity for InventoryLot {
    type Id = LotId;

    fn id(&self) -> &Self::Id {
        &self.lot_id
    }
}
