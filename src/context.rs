use std::sync::Arc;

use crate::broker::{BrokerageCapability, HttpBrokerage, RateLimitedGateway, SimulatedBrokerage};
use crate::config::EngineConfig;
use crate::db::PostgresPersistence;
use crate::error::EngineError;
use crate::execution::TradeLifecycleManager;
use crate::ledger::TradeLedger;
use crate::market::TradingSession;
use crate::store::CandleStore;
use crate::strategy::{BreakoutDetector, LevelAggregator};
use crate::Result;

/// Everything the engine shares, built once at process start.
///
/// Components are handed out explicitly; there is no global state.
#[derive(Clone)]
pub struct TradingContext {
    pub config: EngineConfig,
    pub session: TradingSession,
    pub store: Arc<dyn CandleStore>,
    pub ledger: Arc<dyn TradeLedger>,
    pub gateway: RateLimitedGateway,
}

impl TradingContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CandleStore>,
        ledger: Arc<dyn TradeLedger>,
        broker: Arc<dyn BrokerageCapability>,
    ) -> Result<Self> {
        config.validate()?;
        let session = config.trading_session()?;
        let gateway = RateLimitedGateway::new(
            broker,
            config.max_api_calls_per_minute,
            config.throttle_backoff(),
        );

        Ok(Self {
            config,
            session,
            store,
            ledger,
            gateway,
        })
    }

    /// Postgres for candles and trades; paper or live brokerage per `paper_mode`
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let db = Arc::new(PostgresPersistence::new(&config.database_url).await?);

        let broker: Arc<dyn BrokerageCapability> = if config.paper_mode {
            tracing::info!("📝 PAPER TRADING: simulated brokerage");
            Arc::new(SimulatedBrokerage::new())
        } else {
            let token = config.broker_session_token.as_deref().ok_or_else(|| {
                EngineError::Config("live mode requires broker_session_token".to_string())
            })?;
            tracing::warn!("🔴 LIVE TRADING via {}", config.broker_base_url);
            Arc::new(HttpBrokerage::new(&config.broker_base_url, token))
        };

        Self::new(config, db.clone(), db, broker)
    }

    pub fn level_aggregator(&self) -> LevelAggregator {
        LevelAggregator::new(
            self.store.clone(),
            self.session.clone(),
            self.config.monitoring_timeframe,
        )
        .with_opening_range_candles(self.config.opening_range_candles)
        .with_atr(self.config.atr_period, self.config.atr_fallback)
    }

    pub fn detector(&self) -> BreakoutDetector {
        BreakoutDetector::new(self.config.detector_settings())
    }

    pub fn trade_manager(&self) -> TradeLifecycleManager {
        TradeLifecycleManager::new(
            self.gateway.clone(),
            self.ledger.clone(),
            self.store.clone(),
            self.session.clone(),
            self.config.trade_settings(),
        )
    }
}
