//! Logistics read surface.
//!
//! Deliveries are written by the choreography handlers and keyed by order id.
//! Reads refresh the delivery's copy of the order status from whatever the
//! orders side currently reports; the copy is never pushed.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::debug;

use pharmaflow_core::{DeliveryId, OrderId};
use pharmaflow_logistics::Delivery;
use pharmaflow_orders::OrderStatus;

use crate::read_model::ReadStore;

/// Current status of an order as seen by its owning service.
pub trait OrderStatusLookup: Send + Sync {
    fn order_status(&self, order_id: &OrderId) -> Option<OrderStatus>;
}

impl<T> OrderStatusLookup for Arc<T>
where
    T: OrderStatusLookup + ?Sized,
{
    fn order_status(&self, order_id: &OrderId) -> Option<OrderStatus> {
        (**self).order_status(order_id)
    }
}

#[derive(Debug)]
pub struct DeliveryService<S, L> {
    deliveries: S,
    orders: L,
}

impl<S, L> DeliveryService<S, L>
where
    S: ReadStore<OrderId, Delivery>,
    L: OrderStatusLookup,
{
    pub fn new(deliveries: S, orders: L) -> Self {
        Self { deliveries, orders }
    }

    pub fn get(&self, delivery_id: DeliveryId) -> Option<Delivery> {
        let order_id = self
            .deliveries
            .list()
            .into_iter()
            .find(|d| d.delivery_id == delivery_id)?
            .order_id;
        self.refresh(&order_id)
    }

    pub fn get_by_order(&self, order_id: &OrderId) -> Option<Delivery> {
        self.refresh(order_id)
    }

    /// Deliveries scheduled within `from..=to`, earliest first. Either bound
    /// may be open.
    pub fn list_by_date(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Vec<Delivery> {
        let mut ids: Vec<(NaiveDate, OrderId)> = self
            .deliveries
            .list()
            .into_iter()
            .filter(|d| from.is_none_or(|f| d.scheduled_for >= f))
            .filter(|d| to.is_none_or(|t| d.scheduled_for <= t))
            .map(|d| (d.scheduled_for, d.order_id))
            .collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|(_, order_id)| self.refresh(&order_id))
            .collect()
    }

    fn refresh(&self, order_id: &OrderId) -> Option<Delivery> {
        let Some(status) = self.orders.order_status(order_id) else {
            return self.deliveries.get(order_id);
        };
        self.deliveries.modify(order_id, |delivery| {
            delivery.refresh_snapshot(status.as_str(), Utc::now());
            if status == OrderStatus::InTransit {
                if let Err(err) = delivery.mark_in_transit() {
                    debug!(order_id = %order_id, error = %err, "delivery not moved in transit");
                }
            }
            delivery.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Days;
    use pharmaflow_core::{CustomerId, ProductId};
    use pharmaflow_events::{ConfirmedLine, OrderConfirmed};
    use pharmaflow_logistics::DeliveryStatus;

    use crate::read_model::InMemoryReadStore;

    #[derive(Default)]
    struct Statuses(Mutex<HashMap<OrderId, OrderStatus>>);

    impl Statuses {
        fn set(&self, order_id: OrderId, status: OrderStatus) {
            self.0.lock().unwrap().insert(order_id, status);
        }
    }

    impl OrderStatusLookup for Statuses {
        fn order_status(&self, order_id: &OrderId) -> Option<OrderStatus> {
            self.0.lock().unwrap().get(order_id).copied()
        }
    }

    fn confirmed(order_id: OrderId) -> OrderConfirmed {
        OrderConfirmed {
            order_id,
            seller_id: None,
            customer_id: CustomerId::from("C1"),
            delivery_address: Some("1 Main St".into()),
            lines: vec![ConfirmedLine {
                line_id: 1,
                product_id: ProductId::from("P1"),
                product_name: "Ibuprofen".into(),
                quantity: 2,
                unit_price: 100,
            }],
            total: 200,
            confirmed_at: Utc::now(),
        }
    }

    fn service() -> (
        DeliveryService<Arc<InMemoryReadStore<OrderId, Delivery>>, Arc<Statuses>>,
        Arc<InMemoryReadStore<OrderId, Delivery>>,
        Arc<Statuses>,
    ) {
        let store = Arc::new(InMemoryReadStore::new());
        let statuses = Arc::new(Statuses::default());
        (
            DeliveryService::new(store.clone(), statuses.clone()),
            store,
            statuses,
        )
    }

    #[test]
    fn get_refreshes_the_order_snapshot() {
        let (service, store, statuses) = service();
        let order_id = OrderId::new();
        let delivery = Delivery::from_order_confirmed(&confirmed(order_id), Utc::now());
        let delivery_id = delivery.delivery_id;
        store.upsert(order_id, delivery);

        statuses.set(order_id, OrderStatus::InTransit);
        let read = service.get(delivery_id).unwrap();

        assert_eq!(read.order_status, "in_transit");
        assert_eq!(read.status, DeliveryStatus::InTransit);
        assert_eq!(store.get(&order_id).unwrap().order_status, "in_transit");
    }

    #[test]
    fn unknown_order_status_leaves_the_snapshot() {
        let (service, store, _) = service();
        let order_id = OrderId::new();
        store.upsert(
            order_id,
            Delivery::from_order_confirmed(&confirmed(order_id), Utc::now()),
        );

        let read = service.get_by_order(&order_id).unwrap();
        assert_eq!(read.order_status, "confirmed");
        assert!(service.get(DeliveryId::new()).is_none());
    }

    #[test]
    fn list_by_date_filters_and_sorts() {
        let (service, store, _) = service();
        let now = Utc::now();
        let tomorrow = now.date_naive().checked_add_days(Days::new(1)).unwrap();

        let a = OrderId::new();
        let b = OrderId::new();
        let mut late = Delivery::from_order_confirmed(&confirmed(b), now);
        late.scheduled_for = tomorrow.checked_add_days(Days::new(5)).unwrap();
        store.upsert(b, late);
        store.upsert(a, Delivery::from_order_confirmed(&confirmed(a), now));

        let all = service.list_by_date(None, None);
        assert_eq!(all.iter().map(|d| d.order_id).collect::<Vec<_>>(), vec![a, b]);

        let first = service.list_by_date(Some(tomorrow), Some(tomorrow));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].order_id, a);
    }
}
