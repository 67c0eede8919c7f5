use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::BrokerageCapability;
use crate::error::EngineError;
use crate::models::{OptionContract, OrderSide, OrderState, OrderStatus};
use crate::Result;

/// Premium quoted for every contract unless overridden
pub const PAPER_QUOTE: f64 = 100.0;

#[derive(Debug, Default)]
struct SimState {
    quote: Option<f64>,
    reject_orders: bool,
    fail_orders: bool,
    fail_square_off: bool,
    fail_quotes: bool,
    orders: HashMap<String, OrderStatus>,
}

/// Deterministic paper brokerage.
///
/// Every order fills immediately at the quote in effect when it was placed. Failure
/// toggles let tests drive the engine's error paths.
#[derive(Clone, Default)]
pub struct SimulatedBrokerage {
    state: Arc<Mutex<SimState>>,
    next_order: Arc<AtomicU64>,
    calls: Arc<AtomicUsize>,
}

impl SimulatedBrokerage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|e| EngineError::Brokerage(format!("simulator state poisoned: {}", e)))
    }

    /// Quote every contract at `price` from now on
    pub fn set_quote(&self, price: f64) -> Result<()> {
        self.state()?.quote = Some(price);
        Ok(())
    }

    /// Accept orders but report them as `Rejected`
    pub fn set_reject_orders(&self, reject: bool) -> Result<()> {
        self.state()?.reject_orders = reject;
        Ok(())
    }

    /// Fail order submission outright
    pub fn set_fail_orders(&self, fail: bool) -> Result<()> {
        self.state()?.fail_orders = fail;
        Ok(())
    }

    pub fn set_fail_square_off(&self, fail: bool) -> Result<()> {
        self.state()?.fail_square_off = fail;
        Ok(())
    }

    pub fn set_fail_quotes(&self, fail: bool) -> Result<()> {
        self.state()?.fail_quotes = fail;
        Ok(())
    }

    /// Total capability calls received, successful or not
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn current_quote(state: &SimState) -> f64 {
        state.quote.unwrap_or(PAPER_QUOTE)
    }

    fn record_order(&self, prefix: &str) -> Result<String> {
        let mut state = self.state()?;
        let seq = self.next_order.fetch_add(1, Ordering::SeqCst) + 1;
        let order_id = format!("{}{:06}", prefix, seq);
        let status = if state.reject_orders {
            OrderStatus {
                state: OrderState::Rejected,
                fill_price: None,
            }
        } else {
            OrderStatus {
                state: OrderState::Executed,
                fill_price: Some(Self::current_quote(&state)),
            }
        };
        state.orders.insert(order_id.clone(), status);
        Ok(order_id)
    }
}

#[async_trait]
impl BrokerageCapability for SimulatedBrokerage {
    async fn get_quote(&self, contract: &OptionContract) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state()?;
        if state.fail_quotes {
            return Err(EngineError::Brokerage(format!("no quote for {}", contract)));
        }
        Ok(Self::current_quote(&state))
    }

    async fn place_order(
        &self,
        contract: &OptionContract,
        side: OrderSide,
        quantity: u32,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.state()?.fail_orders {
            return Err(EngineError::Brokerage("order submission refused".to_string()));
        }

        let order_id = self.record_order("PAPER")?;
        tracing::info!(
            "📝 Paper {} {} x{} -> {}",
            side.as_str(),
            contract,
            quantity,
            order_id
        );
        Ok(order_id)
    }

    async fn square_off(&self, contract: &OptionContract, quantity: u32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.state()?.fail_square_off {
            return Err(EngineError::Brokerage("square-off refused".to_string()));
        }

        let order_id = self.record_order("PAPEREX")?;
        tracing::info!("📝 Paper square-off {} x{} -> {}", contract, quantity, order_id);
        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state()?;
        Ok(state
            .orders
            .get(order_id)
            .cloned()
            .unwrap_or_else(OrderStatus::unknown))
    }

    fn name(&self) -> &str {
        "paper"
    }
}
