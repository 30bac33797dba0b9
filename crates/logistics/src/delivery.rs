use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use pharmaflow_core::{DeliveryId, DomainError, Entity, OrderId, ProductId};
use pharmaflow_events::OrderConfirmed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Scheduled,
    InTransit,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLine {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
}

/// Delivery record owned by logistics.
///
/// `order_status` is a copy taken at `snapshot_taken_at`; it is refreshed
/// when the delivery is read, never pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    pub order_id: OrderId,
    pub status: DeliveryStatus,
    pub delivery_address: Option<String>,
    pub lines: Vec<DeliveryLine>,
    pub order_status: String,
    pub snapshot_taken_at: DateTime<Utc>,
    pub scheduled_for: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    /// Orders confirmed today ship the next calendar day.
    pub fn from_order_confirmed(event: &OrderConfirmed, now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        Self {
            delivery_id: DeliveryId::new(),
            order_id: event.order_id,
            status: DeliveryStatus::Scheduled,
            delivery_address: event.delivery_address.clone(),
            lines: event
                .lines
                .iter()
                .map(|l| DeliveryLine {
                    product_id: l.product_id.clone(),
                    product_name: l.product_name.clone(),
                    quantity: l.quantity,
                })
                .collect(),
            order_status: "confirmed".to_string(),
            snapshot_taken_at: now,
            scheduled_for: today.checked_add_days(Days::new(1)).unwrap_or(today),
            created_at: now,
        }
    }

    pub fn refresh_snapshot(&mut self, order_status: impl Into<String>, now: DateTime<Utc>) {
        self.order_status = order_status.into();
        self.snapshot_taken_at = now;
    }

    pub fn mark_in_transit(&mut self) -> Result<(), DomainError> {
        match self.status {
            DeliveryStatus::Scheduled => {
                self.status = DeliveryStatus::InTransit;
                Ok(())
            }
            DeliveryStatus::InTransit => Ok(()),
            other => Err(DomainError::invariant(format!(
                "delivery is {other:?}, cannot go in transit"
            ))),
        }
    }

    /// Idempotent: delivering twice is a no-op.
    pub fn mark_delivered(&mut self) -> Result<(), DomainError> {
        match self.status {
            DeliveryStatus::Scheduled | DeliveryStatus::InTransit => {
                self.status = DeliveryStatus::Delivered;
                Ok(())
            }
            DeliveryStatus::Delivered => Ok(()),
            DeliveryStatus::Cancelled => {
                Err(DomainError::invariant("cancelled delivery cannot be delivered"))
            }
        }
    }

    /// Idempotent: cancelling twice is a no-op.
    pub fn cancel(&mut self) -> Result<(), DomainError> {
        match self.status {
            DeliveryStatus::Scheduled | DeliveryStatus::InTransit => {
                self.status = DeliveryStatus::Cancelled;
                Ok(())
            }
            DeliveryStatus::Cancelled => Ok(()),
            DeliveryStatus::Delivered => {
                Err(DomainError::invariant("delivered delivery cannot be cancelled"))
            }
        }
    }
}

impl Entity for Delivery {
    type Id = DeliveryId;

    fn id(&self) -> &Self::Id {
        &self.delivery_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pharmaflow_core::CustomerId;
    use pharmaflow_events::ConfirmedLine;

    fn confirmed() -> OrderConfirmed {
        OrderConfirmed {
            order_id: OrderId::new(),
            seller_id: None,
            customer_id: CustomerId::from("C1"),
            delivery_address: Some("Av. Paulista 1000".to_string()),
            lines: vec![ConfirmedLine {
                line_id: 1,
                product_id: ProductId::from("P1"),
                product_name: "Insulin".to_string(),
                quantity: 2,
                unit_price: 4500,
            }],
            total: 9000,
            confirmed_at: Utc::now(),
        }
    }

    #[test]
    fn delivery_snapshots_the_confirmed_order() {
        let event = confirmed();
        let now = Utc::now();
        let d = Delivery::from_order_confirmed(&event, now);

        assert_eq!(d.order_id, event.order_id);
        assert_eq!(d.status, DeliveryStatus::Scheduled);
        assert_eq!(d.lines.len(), 1);
        assert_eq!(d.lines[0].quantity, 2);
        assert_eq!(d.order_status, "confirmed");
        assert!(d.scheduled_for > now.date_naive());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut d = Delivery::from_order_confirmed(&confirmed(), Utc::now());
        d.mark_delivered().unwrap();
        d.mark_delivered().unwrap();
        assert!(d.cancel().is_err());
        assert_eq!(d.status, DeliveryStatus::Delivered);
    }
}
