// =============================================================================
// Execution Agent — routes the final decision to the broker adapter
// =============================================================================
//
// Only BUY/SELL with a positive size reach the broker. The client order id
// is generated per graph run so a retried placement cannot double-fill.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{Agent, AgentError};
use crate::broker::{BrokerAdapter, OrderRequest};
use crate::state::{DecisionState, StateUpdate};
use crate::store::{DecisionStore, TradeRecord};
use crate::types::{Signal, TradeDirection};

pub struct ExecutionAgent {
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn DecisionStore>,
    instrument: String,
    paper_trading: bool,
}

impl ExecutionAgent {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        store: Arc<dyn DecisionStore>,
        instrument: impl Into<String>,
        paper_trading: bool,
    ) -> Self {
        Self {
            broker,
            store,
            instrument: instrument.into(),
            paper_trading,
        }
    }
}

#[async_trait]
impl Agent for ExecutionAgent {
    fn name(&self) -> &'static str {
        "execution"
    }

    async fn process(
        &self,
        state: &DecisionState,
        _cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError> {
        let mut update = StateUpdate::default();

        let direction = match state.final_signal {
            Signal::Buy => TradeDirection::Buy,
            Signal::Sell => TradeDirection::Sell,
            other => {
                info!(signal = %other, "no execution needed");
                return Ok(update);
            }
        };

        if state.position_size <= 0.0 {
            warn!("position size is zero; skipping execution");
            return Ok(update);
        }

        let request = OrderRequest {
            client_id: Uuid::new_v4().to_string(),
            instrument: self.instrument.clone(),
            side: direction,
            quantity: state.position_size,
            entry_price: state.entry_price,
            stop_loss: state.stop_loss,
            take_profit: state.take_profit,
        };

        match self.broker.place_order(request).await {
            Ok(fill) => {
                let trade_id = format!("TRD_{}", Utc::now().format("%Y%m%d_%H%M%S"));
                self.store
                    .insert_trade(TradeRecord {
                        trade_id: trade_id.clone(),
                        order_id: fill.order_id.clone(),
                        rule_id: None,
                        instrument: self.instrument.clone(),
                        direction,
                        quantity: fill.filled_quantity,
                        entry_price: state.entry_price,
                        filled_price: fill.filled_price,
                        stop_loss_pct: if state.entry_price > 0.0 {
                            ((state.entry_price - state.stop_loss) / state.entry_price * 100.0)
                                .abs()
                        } else {
                            0.0
                        },
                        target_pct: if state.entry_price > 0.0 {
                            ((state.take_profit - state.entry_price) / state.entry_price * 100.0)
                                .abs()
                        } else {
                            0.0
                        },
                        timestamp: fill.timestamp,
                        status: fill.status.clone(),
                        paper_trading: self.paper_trading,
                    })
                    .await;

                update.push_explanation(
                    self.name(),
                    format!(
                        "Order executed: {direction} {} @ {}, order_id={}",
                        fill.filled_quantity, fill.filled_price, fill.order_id
                    ),
                );
                update.order_id = Some(fill.order_id);
                update.filled_price = Some(fill.filled_price);
                update.filled_quantity = Some(fill.filled_quantity);
                update.execution_timestamp = Some(fill.timestamp);
            }
            Err(e) => {
                warn!(error = %e, "order placement failed");
                update.push_explanation(self.name(), format!("Order placement failed: {e}"));
            }
        }

        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::store::MemoryStore;

    fn agent(broker: Arc<PaperBroker>, store: Arc<MemoryStore>) -> ExecutionAgent {
        ExecutionAgent::new(broker, store, "BTCUSDT", true)
    }

    #[tokio::test]
    async fn hold_signal_places_nothing() {
        let broker = Arc::new(PaperBroker::new());
        let store = Arc::new(MemoryStore::new());
        let exec = agent(Arc::clone(&broker), Arc::clone(&store));

        let state = DecisionState::default(); // final_signal defaults to HOLD
        let update = exec.process(&state, None).await.unwrap();

        assert!(update.order_id.is_none());
        assert!(broker.fills().is_empty());
        assert!(store.trades.lock().is_empty());
    }

    #[tokio::test]
    async fn buy_signal_fills_and_records_trade() {
        let broker = Arc::new(PaperBroker::new());
        let store = Arc::new(MemoryStore::new());
        let exec = agent(Arc::clone(&broker), Arc::clone(&store));

        let mut state = DecisionState::default();
        state.final_signal = Signal::Buy;
        state.position_size = 2.0;
        state.entry_price = 60000.0;
        state.stop_loss = 59100.0;
        state.take_profit = 61800.0;

        let update = exec.process(&state, None).await.unwrap();

        assert!(update.order_id.is_some());
        assert_eq!(update.filled_price, Some(60000.0));
        assert_eq!(update.filled_quantity, Some(2.0));
        assert_eq!(broker.fills().len(), 1);

        let trades = store.trades.lock();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].direction, TradeDirection::Buy);
        assert!(trades[0].paper_trading);
        assert!((trades[0].stop_loss_pct - 1.5).abs() < 1e-9);
        assert!((trades[0].target_pct - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_size_buy_is_skipped() {
        let broker = Arc::new(PaperBroker::new());
        let store = Arc::new(MemoryStore::new());
        let exec = agent(Arc::clone(&broker), Arc::clone(&store));

        let mut state = DecisionState::default();
        state.final_signal = Signal::Buy;
        state.position_size = 0.0;

        let update = exec.process(&state, None).await.unwrap();
        assert!(update.order_id.is_none());
        assert!(broker.fills().is_empty());
    }
}
