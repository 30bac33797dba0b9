//! Order confirmation workflow.
//!
//! ```text
//! load order ──► local preconditions ──► catalog check ──► reserve all lines
//!                                                                │
//!                              release all ◄── dispatch fails ◄──┤
//!                                                                ▼
//!                                                     ConfirmOrder appended
//! ```
//!
//! Stock is reserved synchronously, before the order changes state, so a
//! confirmed order always has its stock held. The broker only carries the
//! follow-up reactions.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use pharmaflow_catalog::ProductCatalog;
use pharmaflow_core::OrderId;
use pharmaflow_events::{EventBus, EventEnvelope, LineQuantity};
use pharmaflow_orders::{
    ConfirmOrder, ConfirmRejection, LineDiagnostic, Order, OrderCommand, OrderStatus,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::reservation::{ReservationClient, ReservationError};

#[derive(Debug, Error)]
pub enum ConfirmError {
    #[error("order not found")]
    NotFound,
    #[error("{0}")]
    Rejected(ConfirmRejection),
    #[error("{} line(s) cannot be confirmed", .0.len())]
    LinesRejected(Vec<LineDiagnostic>),
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<ReservationError> for ConfirmError {
    fn from(value: ReservationError) -> Self {
        match value {
            ReservationError::Rejected(d) => ConfirmError::LinesRejected(d),
            ReservationError::Unavailable(msg) => ConfirmError::Unavailable(msg),
        }
    }
}

pub struct OrderConfirmationService<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    catalog: Arc<dyn ProductCatalog>,
    reservations: Arc<dyn ReservationClient>,
}

impl<S, B> OrderConfirmationService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        catalog: Arc<dyn ProductCatalog>,
        reservations: Arc<dyn ReservationClient>,
    ) -> Self {
        Self {
            dispatcher,
            catalog,
            reservations,
        }
    }

    /// Confirm a draft order, holding stock for every line.
    ///
    /// Either the order ends up confirmed with all its stock reserved, or it
    /// stays a draft and nothing is reserved for it.
    pub async fn confirm(&self, order_id: OrderId) -> Result<Order, ConfirmError> {
        let order = self.load(order_id)?;
        order.check_confirmable().map_err(ConfirmError::Rejected)?;

        let diagnostics = self.check_catalog(&order);
        if !diagnostics.is_empty() {
            return Err(ConfirmError::LinesRejected(diagnostics));
        }

        let lines: Vec<LineQuantity> = order
            .lines()
            .iter()
            .map(|l| LineQuantity {
                product_id: l.product_id.clone(),
                quantity: l.quantity,
            })
            .collect();
        self.reservations.reserve_all(order_id, &lines).await?;

        let command = OrderCommand::ConfirmOrder(ConfirmOrder {
            order_id,
            occurred_at: Utc::now(),
        });
        if let Err(err) = self.dispatcher.dispatch(
            order_id.into(),
            Order::AGGREGATE_TYPE,
            command,
            |id| Order::empty(id.into()),
        ) {
            self.compensate(order_id, &lines).await;
            return Err(err.into());
        }

        let confirmed = self.load(order_id)?;
        info!(%order_id, total = confirmed.total(), "order confirmed");
        Ok(confirmed)
    }

    fn load(&self, order_id: OrderId) -> Result<Order, ConfirmError> {
        self.dispatcher
            .load(order_id.into(), |id| Order::empty(id.into()))?
            .ok_or(ConfirmError::NotFound)
    }

    fn check_catalog(&self, order: &Order) -> Vec<LineDiagnostic> {
        order
            .lines()
            .iter()
            .filter_map(|line| {
                let requested = u64::from(line.quantity);
                match self.catalog.get_product(&line.product_id) {
                    Some(p) if !p.can_be_sold() => {
                        Some(LineDiagnostic::not_found(line.product_id.clone(), requested))
                    }
                    Some(p) if !p.has_valid_price() => Some(LineDiagnostic::invalid_price(
                        line.product_id.clone(),
                        requested,
                    )),
                    Some(_) => None,
                    None => Some(LineDiagnostic::not_found(line.product_id.clone(), requested)),
                }
            })
            .collect()
    }

    async fn compensate(&self, order_id: OrderId, lines: &[LineQuantity]) {
        // A concurrent confirm of the same order shares the reservation key;
        // if it won, the stock is now its to keep.
        if let Ok(current) = self.load(order_id) {
            if current.status() != OrderStatus::Draft {
                return;
            }
        }
        match self.reservations.release_all(order_id, lines).await {
            Ok(()) => warn!(%order_id, "confirmation failed after reserving; stock released"),
            Err(err) => warn!(%order_id, error = %err, "compensating release failed"),
        }
    }
}
