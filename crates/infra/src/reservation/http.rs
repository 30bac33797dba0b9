use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{instrument, warn};

use pharmaflow_core::{OrderId, ProductId};
use pharmaflow_events::LineQuantity;
use pharmaflow_inventory::LedgerOutcome;
use pharmaflow_orders::LineDiagnostic;

use super::wire::{StockRequest, StockResponse};
use super::{ReservationClient, ReservationError, coalesce};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Reserve,
    Release,
    Debit,
}

impl Operation {
    fn path(self) -> &'static str {
        match self {
            Operation::Reserve => "inventory/reserve",
            Operation::Release => "inventory/release",
            Operation::Debit => "inventory/debit",
        }
    }
}

/// Per-line result of one round trip.
enum LineResult {
    Done(LedgerOutcome),
    Refused(Vec<LineDiagnostic>),
}

/// Reservation client for a remote inventory service.
///
/// One request per line, each with the order id so a retried request is
/// absorbed by the remote ledger.
#[derive(Debug, Clone)]
pub struct HttpReservationClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReservationClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ReservationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReservationError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[instrument(skip(self), fields(base_url = %self.base_url), err)]
    async fn call(
        &self,
        op: Operation,
        order_id: OrderId,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<LineResult, ReservationError> {
        let url = format!("{}/{}", self.base_url, op.path());
        let body = StockRequest::single(order_id, product_id.clone(), quantity);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReservationError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ReservationError::Unavailable(format!(
                "inventory service answered {status}"
            )));
        }

        let parsed: StockResponse = response
            .json()
            .await
            .map_err(|e| ReservationError::Unavailable(format!("unreadable response: {e}")))?;

        if status.is_success() && parsed.success {
            let outcome = parsed
                .outcomes
                .first()
                .copied()
                .unwrap_or(LedgerOutcome::Applied);
            return Ok(LineResult::Done(outcome));
        }

        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            let diagnostics = if parsed.diagnostics.is_empty() {
                vec![LineDiagnostic::insufficient_stock(
                    product_id.clone(),
                    u64::from(quantity),
                    0,
                )]
            } else {
                parsed.diagnostics
            };
            return Ok(LineResult::Refused(diagnostics));
        }

        Err(ReservationError::Unavailable(format!(
            "unexpected inventory response {status}"
        )))
    }

    async fn each_line(
        &self,
        op: Operation,
        order_id: OrderId,
        lines: &[(ProductId, u32)],
    ) -> Result<(), ReservationError> {
        let mut diagnostics = Vec::new();
        for (product_id, quantity) in lines {
            match self.call(op, order_id, product_id, *quantity).await? {
                LineResult::Done(_) => {}
                LineResult::Refused(mut d) => diagnostics.append(&mut d),
            }
        }
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(ReservationError::Rejected(diagnostics))
        }
    }

    async fn roll_back(&self, order_id: OrderId, applied: &[(ProductId, u32)]) {
        for (product_id, quantity) in applied {
            match self
                .call(Operation::Release, order_id, product_id, *quantity)
                .await
            {
                Ok(LineResult::Done(_)) => {}
                Ok(LineResult::Refused(d)) => warn!(
                    %order_id,
                    product_id = %product_id,
                    diagnostics = ?d,
                    "compensating release refused"
                ),
                Err(err) => warn!(
                    %order_id,
                    product_id = %product_id,
                    error = %err,
                    "compensating release failed"
                ),
            }
        }
        if !applied.is_empty() {
            warn!(%order_id, lines = applied.len(), "reservation rolled back");
        }
    }
}

#[async_trait]
impl ReservationClient for HttpReservationClient {
    async fn reserve_all(
        &self,
        order_id: OrderId,
        lines: &[LineQuantity],
    ) -> Result<(), ReservationError> {
        let lines = coalesce(lines);
        let mut applied: Vec<(ProductId, u32)> = Vec::new();
        let mut diagnostics = Vec::new();

        for (product_id, quantity) in &lines {
            match self
                .call(Operation::Reserve, order_id, product_id, *quantity)
                .await
            {
                Ok(LineResult::Done(LedgerOutcome::Applied)) => {
                    applied.push((product_id.clone(), *quantity));
                }
                Ok(LineResult::Done(LedgerOutcome::AlreadyApplied)) => {}
                Ok(LineResult::Refused(mut d)) => diagnostics.append(&mut d),
                Err(err) => {
                    // The remote ledger may have applied this line before the
                    // call failed; releasing under the order key is harmless
                    // if it did not.
                    applied.push((product_id.clone(), *quantity));
                    self.roll_back(order_id, &applied).await;
                    return Err(err);
                }
            }
        }

        if diagnostics.is_empty() {
            return Ok(());
        }
        self.roll_back(order_id, &applied).await;
        Err(ReservationError::Rejected(diagnostics))
    }

    async fn release_all(
        &self,
        order_id: OrderId,
        lines: &[LineQuantity],
    ) -> Result<(), ReservationError> {
        self.each_line(Operation::Release, order_id, &coalesce(lines))
            .await
    }

    async fn debit_all(
        &self,
        order_id: OrderId,
        lines: &[LineQuantity],
    ) -> Result<(), ReservationError> {
        self.each_line(Operation::Debit, order_id, &coalesce(lines))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;
    use pharmaflow_core::LotId;
    use pharmaflow_inventory::{IdempotencyKey, InventoryLot, StockTotals};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::ledger::{InMemoryLedger, StockLedger};

    /// Reads one HTTP request and returns its path and body.
    async fn read_request(socket: &mut TcpStream) -> Option<(String, Vec<u8>)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let path = head.split_whitespace().nth(1)?.to_string();
        let length: usize = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        while buf.len() < head_end + length {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Some((path, buf[head_end..head_end + length].to_vec()))
    }

    /// Inventory endpoint over a real ledger that applies a reservation of
    /// `stall_on` and then never answers.
    async fn stub_inventory(ledger: Arc<InMemoryLedger>, stall_on: ProductId) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let ledger = ledger.clone();
                let stall_on = stall_on.clone();
                tokio::spawn(async move {
                    let Some((path, body)) = read_request(&mut socket).await else {
                        return;
                    };
                    let request: StockRequest = serde_json::from_slice(&body).unwrap();
                    let item = &request.items[0];
                    let outcome = if path.ends_with("/reserve") {
                        let key = request.order_id.map(IdempotencyKey::reserve);
                        let outcome = ledger.reserve(&item.product_id, item.quantity, key);
                        if item.product_id == stall_on {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            return;
                        }
                        outcome
                    } else {
                        let key = request.order_id.map(IdempotencyKey::reserve);
                        ledger.release(&item.product_id, item.quantity, key)
                    };
                    let json =
                        serde_json::to_string(&StockResponse::applied(vec![outcome.unwrap()]))
                            .unwrap();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{json}",
                        json.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn timed_out_line_is_released_with_the_rest() {
        let expires = NaiveDate::from_ymd_opt(2099, 1, 1).unwrap();
        let ledger = Arc::new(InMemoryLedger::new());
        for product in ["P1", "P2"] {
            ledger
                .receive_lot(InventoryLot::new(
                    LotId::new(),
                    ProductId::from(product),
                    10,
                    expires,
                ))
                .unwrap();
        }
        let base_url = stub_inventory(ledger.clone(), ProductId::from("P2")).await;
        let client = HttpReservationClient::new(base_url, Duration::from_millis(300)).unwrap();

        let err = client
            .reserve_all(
                OrderId::new(),
                &[
                    LineQuantity {
                        product_id: ProductId::from("P1"),
                        quantity: 2,
                    },
                    LineQuantity {
                        product_id: ProductId::from("P2"),
                        quantity: 3,
                    },
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ReservationError::Unavailable(_)));
        for product in ["P1", "P2"] {
            let lots = ledger.get_availability(&ProductId::from(product)).unwrap();
            assert_eq!(
                StockTotals::of(&lots),
                StockTotals {
                    available: 10,
                    reserved: 0
                },
                "{product} still reserved"
            );
        }
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        // Port 1 is reserved and never has a listener in test environments.
        let client =
            HttpReservationClient::new("http://127.0.0.1:1/", Duration::from_millis(500)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:1");

        let err = client
            .reserve_all(
                OrderId::new(),
                &[LineQuantity {
                    product_id: ProductId::from("P1"),
                    quantity: 1,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::Unavailable(_)));
    }
}
