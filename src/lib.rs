// Core modules
pub mod broker;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod ledger;
pub mod market;
pub mod models;
pub mod store;
pub mod strategy;

// Re-export commonly used types
pub use context::TradingContext;
pub use error::EngineError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
