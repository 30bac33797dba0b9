use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{NaiveDate, Utc};
use tracing::debug;

use pharmaflow_core::{LotId, OrderId, ProductId};
use pharmaflow_inventory::{
    Allocation, IdempotencyKey, InventoryChanged, InventoryLot, LedgerError, LedgerOperation,
    LedgerOutcome, LotView, StockChangeKind, StockTotals, plan_reservation, plan_reserved_draw,
};

use super::{InventoryChangePublisher, ProductStock, StockLedger};

struct LotSlot {
    lot: InventoryLot,
    /// Set under the lot's own lock when the lot is removed, so an operation
    /// that picked the entry up before removal skips it.
    retired: bool,
}

#[derive(Clone)]
struct LotEntry {
    lot_id: LotId,
    cell: Arc<Mutex<LotSlot>>,
}

#[derive(Default)]
struct LotTable {
    /// Entries per product, sorted by lot id (this is the lock order).
    by_product: HashMap<ProductId, Vec<LotEntry>>,
    by_lot: HashMap<LotId, ProductId>,
}

type AppliedKey = (IdempotencyKey, ProductId);

/// Whether the order's reservation of `product_id` was debited or cancelled.
fn settled(
    applied: &HashMap<AppliedKey, Vec<Allocation>>,
    order_id: OrderId,
    product_id: &ProductId,
) -> bool {
    [IdempotencyKey::debit(order_id), IdempotencyKey::cancel(order_id)]
        .into_iter()
        .any(|k| applied.contains_key(&(k, product_id.clone())))
}

/// In-process ledger with per-lot mutual exclusion.
///
/// Lock order, everywhere:
/// 1. `table` (only to look up or change which lots exist; released before
///    any lot lock is taken, except by `receive_lot`/`remove_lot`)
/// 2. every live lot of one product, ascending lot id
/// 3. `applied`
///
/// A mutation checks and changes all lots it touches while holding all of the
/// product's lot locks, so no other operation sees a half-applied reservation.
pub struct InMemoryLedger {
    table: RwLock<LotTable>,
    /// Allocations made under an idempotency key, per product. Debit and
    /// cancel records are never removed.
    applied: Mutex<HashMap<AppliedKey, Vec<Allocation>>>,
    publisher: Option<Arc<dyn InventoryChangePublisher>>,
    today: Option<NaiveDate>,
}

impl core::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let products = self.table.read().map(|t| t.by_product.len()).unwrap_or(0);
        f.debug_struct("InMemoryLedger")
            .field("products", &products)
            .field("publishes", &self.publisher.is_some())
            .finish()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(LotTable::default()),
            applied: Mutex::new(HashMap::new()),
            publisher: None,
            today: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn InventoryChangePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Pin "today" for expiry checks.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn entries_for(&self, product_id: &ProductId) -> Result<Vec<LotEntry>, LedgerError> {
        let table = self.table.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(table.by_product.get(product_id).cloned().unwrap_or_default())
    }

    fn totals_for(&self, product_id: &ProductId) -> Result<StockTotals, LedgerError> {
        let entries = self.entries_for(product_id)?;
        let guards = lock_live(&entries)?;
        Ok(totals_of(&guards))
    }

    fn publish(
        &self,
        product_id: &ProductId,
        change: StockChangeKind,
        quantity: u32,
        totals: StockTotals,
    ) {
        if let Some(publisher) = &self.publisher {
            publisher.publish_change(InventoryChanged {
                product_id: product_id.clone(),
                change,
                quantity,
                total_available: totals.available,
                total_reserved: totals.reserved,
                occurred_at: Utc::now(),
            });
        }
    }
}

fn lock_live(entries: &[LotEntry]) -> Result<Vec<MutexGuard<'_, LotSlot>>, LedgerError> {
    let mut guards = Vec::with_capacity(entries.len());
    for entry in entries {
        let guard = entry.cell.lock().map_err(|_| LedgerError::Poisoned)?;
        if !guard.retired {
            guards.push(guard);
        }
    }
    Ok(guards)
}

fn totals_of(guards: &[MutexGuard<'_, LotSlot>]) -> StockTotals {
    let views: Vec<LotView> = guards.iter().map(|g| g.lot.view()).collect();
    StockTotals::of(&views)
}

fn lots_of<'a>(guards: &'a [MutexGuard<'_, LotSlot>]) -> Vec<&'a InventoryLot> {
    guards.iter().map(|g| &g.lot).collect()
}

/// Check that every allocation still has that many reserved units.
fn check_reserved(
    guards: &[MutexGuard<'_, LotSlot>],
    plan: &[Allocation],
) -> Result<(), LedgerError> {
    let requested: u64 = plan.iter().map(|a| u64::from(a.quantity)).sum();
    let mut reserved = 0u64;
    let mut short = false;
    for a in plan {
        let lot = guards
            .iter()
            .find(|g| g.lot.lot_id() == a.lot_id)
            .map(|g| &g.lot)
            .ok_or(LedgerError::LotNotFound(a.lot_id))?;
        reserved += u64::from(lot.quantity_reserved().min(a.quantity));
        short |= lot.quantity_reserved() < a.quantity;
    }
    if short {
        return Err(LedgerError::InsufficientReservedStock {
            requested,
            reserved,
        });
    }
    Ok(())
}

fn apply_plan(
    guards: &mut [MutexGuard<'_, LotSlot>],
    plan: &[Allocation],
    op: fn(&mut InventoryLot, u32) -> Result<(), LedgerError>,
) -> Result<(), LedgerError> {
    for a in plan {
        let slot = guards
            .iter_mut()
            .find(|g| g.lot.lot_id() == a.lot_id)
            .ok_or(LedgerError::LotNotFound(a.lot_id))?;
        op(&mut slot.lot, a.quantity)?;
    }
    Ok(())
}

/// Take `quantity` units off the front of a held allocation.
fn split_allocation(
    held: &[Allocation],
    quantity: u32,
) -> Result<(Vec<Allocation>, Vec<Allocation>), LedgerError> {
    if quantity == 0 {
        return Err(LedgerError::InvalidQuantity);
    }
    let total: u64 = held.iter().map(|a| u64::from(a.quantity)).sum();
    if u64::from(quantity) > total {
        return Err(LedgerError::InsufficientReservedStock {
            requested: u64::from(quantity),
            reserved: total,
        });
    }

    let mut remaining = quantity;
    let mut taken = Vec::new();
    let mut left = Vec::new();
    for a in held {
        let q = remaining.min(a.quantity);
        if q > 0 {
            taken.push(Allocation {
                lot_id: a.lot_id,
                quantity: q,
            });
            remaining -= q;
        }
        if a.quantity > q {
            left.push(Allocation {
                lot_id: a.lot_id,
                quantity: a.quantity - q,
            });
        }
    }
    Ok((taken, left))
}

impl StockLedger for InMemoryLedger {
    fn receive_lot(&self, lot: InventoryLot) -> Result<LedgerOutcome, LedgerError> {
        let lot_id = lot.lot_id();
        let product_id = lot.product_id().clone();
        let quantity = lot.quantity_available();

        {
            let mut guard = self.table.write().map_err(|_| LedgerError::Poisoned)?;
            let table = &mut *guard;

            if let Some(existing_product) = table.by_lot.get(&lot_id) {
                if *existing_product != product_id {
                    return Err(LedgerError::LotAlreadyExists(lot_id));
                }
                let existing = table
                    .by_product
                    .get(existing_product)
                    .and_then(|entries| entries.iter().find(|e| e.lot_id == lot_id));
                if let Some(entry) = existing {
                    let slot = entry.cell.lock().map_err(|_| LedgerError::Poisoned)?;
                    if slot.lot.expiration_date() != lot.expiration_date() {
                        return Err(LedgerError::LotAlreadyExists(lot_id));
                    }
                }
                debug!(%lot_id, "lot already received");
                return Ok(LedgerOutcome::AlreadyApplied);
            }

            let entries = table.by_product.entry(product_id.clone()).or_default();
            let pos = entries.partition_point(|e| e.lot_id < lot_id);
            entries.insert(
                pos,
                LotEntry {
                    lot_id,
                    cell: Arc::new(Mutex::new(LotSlot {
                        lot,
                        retired: false,
                    })),
                },
            );
            table.by_lot.insert(lot_id, product_id.clone());
        }

        let totals = self.totals_for(&product_id)?;
        self.publish(&product_id, StockChangeKind::Received, quantity, totals);
        Ok(LedgerOutcome::Applied)
    }

    fn remove_lot(&self, lot_id: LotId) -> Result<LotView, LedgerError> {
        let (product_id, view) = {
            let mut guard = self.table.write().map_err(|_| LedgerError::Poisoned)?;
            let table = &mut *guard;

            let product_id = table
                .by_lot
                .get(&lot_id)
                .cloned()
                .ok_or(LedgerError::LotNotFound(lot_id))?;
            let entries = table
                .by_product
                .get_mut(&product_id)
                .ok_or(LedgerError::LotNotFound(lot_id))?;
            let idx = entries
                .iter()
                .position(|e| e.lot_id == lot_id)
                .ok_or(LedgerError::LotNotFound(lot_id))?;

            let view = {
                let mut slot = entries[idx].cell.lock().map_err(|_| LedgerError::Poisoned)?;
                let reserved = slot.lot.quantity_reserved();
                if reserved > 0 {
                    return Err(LedgerError::LotHasReservations { lot_id, reserved });
                }
                slot.retired = true;
                slot.lot.view()
            };

            entries.remove(idx);
            if entries.is_empty() {
                table.by_product.remove(&product_id);
            }
            table.by_lot.remove(&lot_id);
            (product_id, view)
        };

        let totals = self.totals_for(&product_id)?;
        self.publish(
            &product_id,
            StockChangeKind::Removed,
            view.quantity_available,
            totals,
        );
        Ok(view)
    }

    fn get_availability(&self, product_id: &ProductId) -> Result<Vec<LotView>, LedgerError> {
        let entries = self.entries_for(product_id)?;
        let guards = lock_live(&entries)?;
        Ok(guards.iter().map(|g| g.lot.view()).collect())
    }

    fn reserve(
        &self,
        product_id: &ProductId,
        quantity: u32,
        key: Option<IdempotencyKey>,
    ) -> Result<LedgerOutcome, LedgerError> {
        let entries = self.entries_for(product_id)?;
        let mut guards = lock_live(&entries)?;
        if guards.is_empty() {
            return Err(LedgerError::ProductNotFound(product_id.clone()));
        }

        let mut applied = self.applied.lock().map_err(|_| LedgerError::Poisoned)?;
        let record = key.map(|k| (k, product_id.clone()));
        if let Some(record) = &record {
            if applied.contains_key(record) || settled(&applied, record.0.order_id, product_id) {
                debug!(key = %record.0, %product_id, "reservation already applied");
                return Ok(LedgerOutcome::AlreadyApplied);
            }
        }

        let plan = plan_reservation(&lots_of(&guards), quantity, self.today())?;
        apply_plan(&mut guards, &plan, InventoryLot::reserve)?;
        if let Some(record) = record {
            applied.insert(record, plan);
        }
        drop(applied);

        let totals = totals_of(&guards);
        drop(guards);
        self.publish(product_id, StockChangeKind::Reserved, quantity, totals);
        Ok(LedgerOutcome::Applied)
    }

    fn release(
        &self,
        product_id: &ProductId,
        quantity: u32,
        key: Option<IdempotencyKey>,
    ) -> Result<LedgerOutcome, LedgerError> {
        let entries = self.entries_for(product_id)?;
        let mut guards = lock_live(&entries)?;
        if guards.is_empty() {
            return Err(LedgerError::ProductNotFound(product_id.clone()));
        }

        let mut applied = self.applied.lock().map_err(|_| LedgerError::Poisoned)?;
        match key {
            Some(k) => {
                let cancel_record = (IdempotencyKey::cancel(k.order_id), product_id.clone());
                let cancelling = k.operation == LedgerOperation::Cancel;
                if cancelling && applied.contains_key(&cancel_record) {
                    debug!(key = %k, %product_id, "cancellation already applied");
                    return Ok(LedgerOutcome::AlreadyApplied);
                }

                let reserve_record = (IdempotencyKey::reserve(k.order_id), product_id.clone());
                let Some(held) = applied.get(&reserve_record) else {
                    if cancelling {
                        applied.insert(cancel_record, Vec::new());
                    }
                    debug!(order_id = %k.order_id, %product_id, "nothing held to release");
                    return Ok(LedgerOutcome::AlreadyApplied);
                };
                let (taken, left) = split_allocation(held, quantity)?;
                check_reserved(&guards, &taken)?;
                apply_plan(&mut guards, &taken, InventoryLot::release)?;
                if left.is_empty() {
                    applied.remove(&reserve_record);
                } else {
                    applied.insert(reserve_record, left);
                }
                if cancelling {
                    applied.insert(cancel_record, taken);
                }
            }
            None => {
                let plan = plan_reserved_draw(&lots_of(&guards), quantity)?;
                apply_plan(&mut guards, &plan, InventoryLot::release)?;
            }
        }
        drop(applied);

        let totals = totals_of(&guards);
        drop(guards);
        self.publish(product_id, StockChangeKind::Released, quantity, totals);
        Ok(LedgerOutcome::Applied)
    }

    fn debit(
        &self,
        product_id: &ProductId,
        quantity: u32,
        key: Option<IdempotencyKey>,
    ) -> Result<LedgerOutcome, LedgerError> {
        let entries = self.entries_for(product_id)?;
        let mut guards = lock_live(&entries)?;
        if guards.is_empty() {
            return Err(LedgerError::ProductNotFound(product_id.clone()));
        }

        let mut applied = self.applied.lock().map_err(|_| LedgerError::Poisoned)?;
        match key {
            Some(k) => {
                let debit_record = (IdempotencyKey::debit(k.order_id), product_id.clone());
                if applied.contains_key(&debit_record) {
                    debug!(key = %debit_record.0, %product_id, "debit already applied");
                    return Ok(LedgerOutcome::AlreadyApplied);
                }

                let reserve_record = (IdempotencyKey::reserve(k.order_id), product_id.clone());
                let taken = match applied.get(&reserve_record) {
                    Some(held) => {
                        let (taken, left) = split_allocation(held, quantity)?;
                        check_reserved(&guards, &taken)?;
                        apply_plan(&mut guards, &taken, InventoryLot::debit)?;
                        if left.is_empty() {
                            applied.remove(&reserve_record);
                        } else {
                            applied.insert(reserve_record, left);
                        }
                        taken
                    }
                    None => {
                        let plan = plan_reserved_draw(&lots_of(&guards), quantity)?;
                        apply_plan(&mut guards, &plan, InventoryLot::debit)?;
                        plan
                    }
                };
                applied.insert(debit_record, taken);
            }
            None => {
                let plan = plan_reserved_draw(&lots_of(&guards), quantity)?;
                apply_plan(&mut guards, &plan, InventoryLot::debit)?;
            }
        }
        drop(applied);

        let totals = totals_of(&guards);
        drop(guards);
        self.publish(product_id, StockChangeKind::Debited, quantity, totals);
        Ok(LedgerOutcome::Applied)
    }

    fn snapshot(&self) -> Result<Vec<ProductStock>, LedgerError> {
        let mut products: Vec<(ProductId, Vec<LotEntry>)> = {
            let table = self.table.read().map_err(|_| LedgerError::Poisoned)?;
            table
                .by_product
                .iter()
                .map(|(p, entries)| (p.clone(), entries.clone()))
                .collect()
        };
        products.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(products.len());
        for (product_id, entries) in products {
            let guards = lock_live(&entries)?;
            let lots: Vec<LotView> = guards.iter().map(|g| g.lot.view()).collect();
            if lots.is_empty() {
                continue;
            }
            out.push(ProductStock {
                product_id,
                totals: StockTotals::of(&lots),
                lots,
            });
        }
        Ok(out)
    }
}
