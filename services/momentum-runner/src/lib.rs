//! Momentum Runner Library
//!
//! Multi-timeframe signal and position-lifecycle engine for a single
//! futures instrument.

pub mod client;
pub mod config;
pub mod error;
pub mod exits;
pub mod gateway;
pub mod intent;
pub mod orderflow;
pub mod portfolio;
pub mod risk;
pub mod runner;
pub mod signal;
pub mod sizing;
pub mod trend;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export main types for convenience
pub use client::BridgeClient;
pub use config::{EngineConfig, SignalPolicyKind, TradingMode};
pub use error::{ConfigError, EngineError, GatewayError, GatewayResult};
pub use exits::{ExitManager, ExitPhase, ExitReason, ExitReport, Position};
pub use gateway::{AccountFeed, Collaborators, MarketData, OrderBookFeed, OrderGateway};
pub use orderflow::{OrderBookConfirmation, OrderFlowConfirmer};
pub use portfolio::{PositionBook, PositionSummary};
pub use risk::RiskGuard;
pub use runner::{CycleOutcome, StrategyRunner};
pub use signal::{SignalGenerator, SignalResult};
pub use sizing::{PositionSizer, ProtectedEntry};
pub use trend::{TrendAnalyzer, TrendDetails};
pub use types::{Direction, TradeMode, TrendState};
