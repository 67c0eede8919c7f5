// Brokerage access: capability trait, adapters and the rate-limited gateway
pub mod gateway;
pub mod http;
pub mod simulated;

use async_trait::async_trait;

use crate::models::{OptionContract, OrderSide, OrderStatus};
use crate::Result;

pub use gateway::{GatewayUsage, RateLimitedGateway};
pub use http::HttpBrokerage;
pub use simulated::SimulatedBrokerage;

/// Operations the engine needs from a brokerage.
///
/// Implementations are never called directly by the engine; every call goes through
/// [`RateLimitedGateway`].
#[async_trait]
pub trait BrokerageCapability: Send + Sync {
    /// Last traded premium of an option contract
    async fn get_quote(&self, contract: &OptionContract) -> Result<f64>;

    /// Submit a market order, returning the broker order id
    async fn place_order(
        &self,
        contract: &OptionContract,
        side: OrderSide,
        quantity: u32,
    ) -> Result<String>;

    /// Close an existing position at market, returning the exit order id
    async fn square_off(&self, contract: &OptionContract, quantity: u32) -> Result<String>;

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus>;

    fn name(&self) -> &str;
}
