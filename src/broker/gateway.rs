use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::broker::BrokerageCapability;
use crate::models::{OptionContract, OrderSide, OrderStatus};
use crate::Result;

/// Length of the trailing window the call budget applies to
pub const WINDOW: Duration = Duration::from_secs(60);

/// Usage above this share of the budget is reported as unsafe
const SAFE_USAGE_PCT: f64 = 90.0;

struct CallWindow {
    calls: VecDeque<Instant>,
    total: u64,
}

impl CallWindow {
    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot of the gateway's call budget
#[derive(Debug, Clone, Serialize)]
pub struct GatewayUsage {
    pub calls_in_window: usize,
    pub max_calls: usize,
    pub remaining: usize,
    pub usage_pct: f64,
    pub total_session_calls: u64,
    pub is_safe: bool,
}

/// Sole path to the brokerage.
///
/// Admits at most `max_calls` calls in any trailing 60-second window. The call log is
/// a FIFO of admission instants behind an async mutex; a caller that finds the
/// window full releases the lock, sleeps the backoff and tries again.
#[derive(Clone)]
pub struct RateLimitedGateway {
    broker: Arc<dyn BrokerageCapability>,
    window: Arc<Mutex<CallWindow>>,
    max_calls: usize,
    backoff: Duration,
}

impl RateLimitedGateway {
    pub fn new(broker: Arc<dyn BrokerageCapability>, max_calls: usize, backoff: Duration) -> Self {
        Self {
            broker,
            window: Arc::new(Mutex::new(CallWindow {
                calls: VecDeque::with_capacity(max_calls),
                total: 0,
            })),
            max_calls,
            backoff,
        }
    }

    pub fn broker_name(&self) -> &str {
        self.broker.name()
    }

    /// Wait until the budget has room, then record one call
    async fn acquire(&self, tag: &str) {
        loop {
            let mut window = self.window.lock().await;
            let now = Instant::now();
            window.evict(now);

            if window.calls.len() < self.max_calls {
                window.calls.push_back(now);
                window.total += 1;
                return;
            }

            let in_window = window.calls.len();
            drop(window);

            tracing::warn!(
                "⏳ API budget exhausted ({}/{} in last 60s), holding '{}' for {:?}",
                in_window,
                self.max_calls,
                tag,
                self.backoff
            );
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Run one brokerage call under the budget.
    ///
    /// Errors are logged with `tag` and turned into `None`; callers treat that as
    /// "no result this tick".
    pub async fn call<T, F, Fut>(&self, tag: &str, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(tag).await;

        match f().await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("❌ Brokerage call '{}' failed: {}", tag, e);
                None
            }
        }
    }

    pub async fn quote(&self, contract: &OptionContract) -> Option<f64> {
        let tag = format!("get_quote_{}", contract.right.as_str());
        self.call(&tag, || self.broker.get_quote(contract)).await
    }

    pub async fn place_order(
        &self,
        contract: &OptionContract,
        side: OrderSide,
        quantity: u32,
    ) -> Option<String> {
        self.call("place_order", || {
            self.broker.place_order(contract, side, quantity)
        })
        .await
    }

    pub async fn square_off(&self, contract: &OptionContract, quantity: u32) -> Option<String> {
        self.call("square_off", || self.broker.square_off(contract, quantity))
            .await
    }

    pub async fn order_status(&self, order_id: &str) -> Option<OrderStatus> {
        self.call("get_order_status", || self.broker.get_order_status(order_id))
            .await
    }

    pub async fn usage(&self) -> GatewayUsage {
        let mut window = self.window.lock().await;
        window.evict(Instant::now());

        let calls_in_window = window.calls.len();
        let usage_pct = if self.max_calls == 0 {
            100.0
        } else {
            calls_in_window as f64 / self.max_calls as f64 * 100.0
        };

        GatewayUsage {
            calls_in_window,
            max_calls: self.max_calls,
            remaining: self.max_calls.saturating_sub(calls_in_window),
            usage_pct,
            total_session_calls: window.total,
            is_safe: usage_pct < SAFE_USAGE_PCT,
        }
    }
}
