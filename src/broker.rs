// =============================================================================
// Broker adapter — order placement with full paper-mode simulation
// =============================================================================
//
// Orders carry stop-loss and take-profit as bracket parameters and a
// caller-supplied client id so a retried call cannot double-fill. Paper mode
// returns immediately with status COMPLETE; a live adapter awaits the venue
// behind the same trait.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::types::TradeDirection;

/// A bracket order request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Caller-supplied idempotency key. Replaying the same id returns the
    /// original fill instead of placing a second order.
    pub client_id: String,
    pub instrument: String,
    pub side: TradeDirection,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Fill details returned by the venue (or the paper simulator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub filled_price: f64,
    pub filled_quantity: f64,
    pub timestamp: DateTime<Utc>,
    /// COMPLETE for paper fills; live adapters may report PENDING.
    pub status: String,
}

/// Order-placement gateway.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn place_order(&self, request: OrderRequest) -> anyhow::Result<OrderFill>;
}

// ---------------------------------------------------------------------------
// Paper broker
// ---------------------------------------------------------------------------

/// Simulated venue: every order fills instantly at the requested entry price.
#[derive(Default)]
pub struct PaperBroker {
    fills: Mutex<HashMap<String, OrderFill>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// All fills recorded so far (test/diagnostic surface).
    pub fn fills(&self) -> Vec<OrderFill> {
        self.fills.lock().values().cloned().collect()
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn place_order(&self, request: OrderRequest) -> anyhow::Result<OrderFill> {
        let mut fills = self.fills.lock();

        // Idempotency: a replayed client id returns the original fill.
        if let Some(existing) = fills.get(&request.client_id) {
            return Ok(existing.clone());
        }

        let fill = OrderFill {
            order_id: format!("PAPER_{}", Uuid::new_v4()),
            filled_price: request.entry_price,
            filled_quantity: request.quantity,
            timestamp: Utc::now(),
            status: "COMPLETE".to_string(),
        };

        info!(
            instrument = %request.instrument,
            side = %request.side,
            quantity = request.quantity,
            price = request.entry_price,
            stop_loss = request.stop_loss,
            take_profit = request.take_profit,
            order_id = %fill.order_id,
            "paper order filled"
        );

        fills.insert(request.client_id, fill.clone());
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(client_id: &str) -> OrderRequest {
        OrderRequest {
            client_id: client_id.to_string(),
            instrument: "BTCUSDT".to_string(),
            side: TradeDirection::Buy,
            quantity: 0.5,
            entry_price: 60000.0,
            stop_loss: 59100.0,
            take_profit: 61800.0,
        }
    }

    #[tokio::test]
    async fn paper_order_fills_complete() {
        let broker = PaperBroker::new();
        let fill = broker.place_order(request("c1")).await.unwrap();
        assert_eq!(fill.status, "COMPLETE");
        assert_eq!(fill.filled_price, 60000.0);
        assert_eq!(fill.filled_quantity, 0.5);
    }

    #[tokio::test]
    async fn replayed_client_id_is_idempotent() {
        let broker = PaperBroker::new();
        let first = broker.place_order(request("same")).await.unwrap();
        let second = broker.place_order(request("same")).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(broker.fills().len(), 1);
    }
}
