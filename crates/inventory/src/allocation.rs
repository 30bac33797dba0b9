//! Lot-selection policy: earliest expiry first (FEFO).
//!
//! Lots are ordered by `(expiration_date, lot_id)`, so the plan for a given
//! set of counters is deterministic. A request is covered from as few lots as
//! that order allows: the first lot takes as much as it can, then the next.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use pharmaflow_core::LotId;

use crate::error::LedgerError;
use crate::lot::InventoryLot;

/// Units taken from (or returned to) one lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub lot_id: LotId,
    pub quantity: u32,
}

pub fn sort_fefo(lots: &mut [&InventoryLot]) {
    lots.sort_by_key(|l| (l.expiration_date(), l.lot_id()));
}

/// Plan a reservation of `quantity` units over unexpired lots.
///
/// Fails with `InsufficientStock` carrying the eligible total when the lots
/// cannot cover the request; nothing is planned partially.
pub fn plan_reservation(
    lots: &[&InventoryLot],
    quantity: u32,
    today: NaiveDate,
) -> Result<Vec<Allocation>, LedgerError> {
    if quantity == 0 {
        return Err(LedgerError::InvalidQuantity);
    }

    let mut eligible: Vec<&InventoryLot> = lots
        .iter()
        .copied()
        .filter(|l| !l.is_expired_on(today) && l.quantity_available() > 0)
        .collect();

    let available: u64 = eligible
        .iter()
        .map(|l| u64::from(l.quantity_available()))
        .sum();
    if u64::from(quantity) > available {
        return Err(LedgerError::InsufficientStock {
            requested: u64::from(quantity),
            available,
        });
    }

    sort_fefo(&mut eligible);
    Ok(take(eligible, quantity, InventoryLot::quantity_available))
}

/// Plan which reserved units an unkeyed release or debit draws from.
///
/// Expired lots are included: their reserved units still have to go somewhere.
pub fn plan_reserved_draw(
    lots: &[&InventoryLot],
    quantity: u32,
) -> Result<Vec<Allocation>, LedgerError> {
    if quantity == 0 {
        return Err(LedgerError::InvalidQuantity);
    }

    let mut holding: Vec<&InventoryLot> = lots
        .iter()
        .copied()
        .filter(|l| l.quantity_reserved() > 0)
        .collect();

    let reserved: u64 = holding
        .iter()
        .map(|l| u64::from(l.quantity_reserved()))
        .sum();
    if u64::from(quantity) > reserved {
        return Err(LedgerError::InsufficientReservedStock {
            requested: u64::from(quantity),
            reserved,
        });
    }

    sort_fefo(&mut holding);
    Ok(take(holding, quantity, InventoryLot::quantity_reserved))
}

fn take(
    ordered: Vec<&InventoryLot>,
    quantity: u32,
    counter: fn(&InventoryLot) -> u32,
) -> Vec<Allocation> {
    let mut remaining = quantity;
    let mut plan = Vec::new();
    for lot in ordered {
        if remaining == 0 {
            break;
        }
        let q = remaining.min(counter(lot));
        plan.push(Allocation {
            lot_id: lot.lot_id(),
            quantity: q,
        });
        remaining -= q;
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use pharmaflow_core::ProductId;
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn lot(n: u128, quantity: u32, expires: NaiveDate) -> InventoryLot {
        InventoryLot::new(
            LotId::from_uuid(Uuid::from_u128(n)),
            ProductId::from("P1"),
            quantity,
            expires,
        )
    }

    fn today() -> NaiveDate {
        date(2030, 1, 1)
    }

    #[test]
    fn earliest_expiry_is_consumed_first() {
        let late = lot(1, 10, date(2031, 1, 1));
        let early = lot(2, 10, date(2030, 6, 1));

        let plan = plan_reservation(&[&late, &early], 4, today()).unwrap();
        assert_eq!(
            plan,
            vec![Allocation {
                lot_id: early.lot_id(),
                quantity: 4
            }]
        );
    }

    #[test]
    fn request_spills_over_into_next_lot() {
        let a = lot(1, 3, date(2030, 2, 1));
        let b = lot(2, 10, date(2030, 3, 1));

        let plan = plan_reservation(&[&b, &a], 5, today()).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].lot_id, a.lot_id());
        assert_eq!(plan[0].quantity, 3);
        assert_eq!(plan[1].lot_id, b.lot_id());
        assert_eq!(plan[1].quantity, 2);
    }

    #[test]
    fn equal_expiry_breaks_ties_by_lot_id() {
        let expiry = date(2030, 5, 5);
        let second = lot(9, 5, expiry);
        let first = lot(3, 5, expiry);

        let plan = plan_reservation(&[&second, &first], 1, today()).unwrap();
        assert_eq!(plan[0].lot_id, first.lot_id());
    }

    #[test]
    fn expired_lots_are_not_eligible() {
        let expired = lot(1, 100, date(2029, 12, 31));
        let fresh = lot(2, 3, date(2030, 12, 31));

        let err = plan_reservation(&[&expired, &fresh], 5, today()).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                requested: 5,
                available: 3
            }
        );
    }

    #[test]
    fn reserved_draw_fails_when_holds_are_short() {
        let mut a = lot(1, 10, date(2030, 2, 1));
        a.reserve(2).unwrap();

        let err = plan_reserved_draw(&[&a], 3).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientReservedStock {
                requested: 3,
                reserved: 2
            }
        );
    }
}
