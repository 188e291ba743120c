//! Position sizing and protective prices
//!
//! Stop placement is an ordered list of [`StopStrategy`] values tried in
//! turn; the first that yields a price wins.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::gateway::{guarded, AccountFeed, MarketData};
use crate::types::{columns, Direction, IndicatorSpec, TickMeta, Timeframe};

/// Source of a protective stop distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStrategy {
    /// One ATR from entry
    Atr,
    /// `stop_ticks` ticks from entry
    FixedTicks,
    /// A fraction of the entry price
    PercentOfPrice,
}

/// Default fallback order
pub const STOP_CHAIN: [StopStrategy; 3] = [
    StopStrategy::Atr,
    StopStrategy::FixedTicks,
    StopStrategy::PercentOfPrice,
];

/// Market inputs the stop strategies draw on
#[derive(Debug, Clone, Copy, Default)]
pub struct StopInputs {
    pub atr: Option<f64>,
    pub tick_meta: Option<TickMeta>,
}

impl StopStrategy {
    /// Stop price for this strategy, `None` when its inputs are missing
    pub fn stop_price(
        &self,
        config: &RiskConfig,
        inputs: &StopInputs,
        entry: Decimal,
        direction: Direction,
    ) -> Option<Decimal> {
        let distance = match self {
            StopStrategy::Atr => {
                let atr = inputs.atr.filter(|v| v.is_finite() && *v > 0.0)?;
                let raw = Decimal::from_f64(atr)?;
                match inputs.tick_meta.filter(TickMeta::is_valid) {
                    // keep the stop on the tick grid, never tighter than one tick
                    Some(meta) => ((raw / meta.tick_size).round() * meta.tick_size).max(meta.tick_size),
                    None => raw,
                }
            }
            StopStrategy::FixedTicks => {
                let meta = inputs.tick_meta.filter(TickMeta::is_valid)?;
                Decimal::from(config.stop_ticks) * meta.tick_size
            }
            StopStrategy::PercentOfPrice => entry * config.percent_stop,
        };
        if distance <= Decimal::ZERO {
            return None;
        }
        Some(entry - direction.sign() * distance)
    }
}

/// Target at `rr_ratio` times the stop distance, away from the stop
pub fn target_price(entry: Decimal, stop: Decimal, direction: Direction, rr_ratio: Decimal) -> Decimal {
    let distance = (entry - stop).abs() * rr_ratio;
    entry + direction.sign() * distance
}

/// Contracts affordable within the risk budget, clamped to `[1, max_size]`
pub fn position_size(
    balance: Decimal,
    risk_per_trade: Decimal,
    entry: Decimal,
    stop: Decimal,
    tick_meta: &TickMeta,
    max_size: u32,
) -> Option<u32> {
    if !tick_meta.is_valid() || balance <= Decimal::ZERO {
        return None;
    }
    let risk_amount = balance * risk_per_trade;
    let stop_ticks = (entry - stop).abs() / tick_meta.tick_size;
    let risk_per_contract = stop_ticks * tick_meta.tick_value;
    if risk_per_contract <= Decimal::ZERO {
        return None;
    }

    let raw = (risk_amount / risk_per_contract).floor().to_u32().unwrap_or(u32::MAX);
    Some(raw.min(max_size).max(1))
}

/// Sized entry with its protective prices
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectedEntry {
    pub stop_price: Decimal,
    pub target_price: Decimal,
    pub size: u32,
    pub stop_source: StopStrategy,
}

pub struct PositionSizer {
    market: Arc<dyn MarketData>,
    account: Arc<dyn AccountFeed>,
    config: RiskConfig,
    atr_timeframe: Timeframe,
    chain: Vec<StopStrategy>,
    call_timeout: Duration,
}

impl PositionSizer {
    pub fn new(
        market: Arc<dyn MarketData>,
        account: Arc<dyn AccountFeed>,
        config: RiskConfig,
        atr_timeframe: Timeframe,
        call_timeout: Duration,
    ) -> Self {
        Self {
            market,
            account,
            config,
            atr_timeframe,
            chain: STOP_CHAIN.to_vec(),
            call_timeout,
        }
    }

    /// Replace the stop fallback order
    pub fn with_stop_chain(mut self, chain: Vec<StopStrategy>) -> Self {
        self.chain = chain;
        self
    }

    async fn atr(&self) -> Option<f64> {
        let period = self.config.atr_period as usize;
        let spec = [IndicatorSpec::Atr { period: self.config.atr_period }];
        let call = self.market.indicator_frame(self.atr_timeframe, period * 2, &spec);
        match guarded("indicator_frame", self.call_timeout, call).await {
            Ok(frame) if frame.has_window(period) => frame.last(columns::ATR),
            Ok(frame) => {
                debug!(got = frame.len(), need = period, "ATR window too short");
                None
            }
            Err(e) => {
                debug!(error = %e, "ATR frame unavailable");
                None
            }
        }
    }

    pub async fn tick_meta(&self) -> Option<TickMeta> {
        match guarded("tick_meta", self.call_timeout, self.account.tick_meta()).await {
            Ok(meta) if meta.is_valid() => Some(meta),
            Ok(meta) => {
                warn!(tick_size = %meta.tick_size, tick_value = %meta.tick_value, "Invalid tick metadata");
                None
            }
            Err(e) => {
                debug!(error = %e, "Tick metadata unavailable");
                None
            }
        }
    }

    /// First stop the chain produces
    pub fn stop_for(&self, inputs: &StopInputs, entry: Decimal, direction: Direction) -> Option<(Decimal, StopStrategy)> {
        self.chain.iter().find_map(|strategy| {
            strategy
                .stop_price(&self.config, inputs, entry, direction)
                .map(|stop| (stop, *strategy))
        })
    }

    /// Stop, target and size for an entry; `None` when the trade is unsizeable
    pub async fn size_and_protect(&self, entry: Decimal, direction: Direction) -> Option<ProtectedEntry> {
        let inputs = StopInputs {
            atr: self.atr().await,
            tick_meta: self.tick_meta().await,
        };

        let Some((stop_price, stop_source)) = self.stop_for(&inputs, entry, direction) else {
            warn!(entry = %entry, "No stop strategy produced a price");
            return None;
        };
        let target = target_price(entry, stop_price, direction, self.config.rr_ratio);

        let Some(meta) = inputs.tick_meta else {
            info!("Unsizeable entry: tick metadata unavailable");
            return None;
        };
        let balance = match guarded("balance", self.call_timeout, self.account.balance()).await {
            Ok(b) => b,
            Err(e) => {
                info!(error = %e, "Unsizeable entry: balance unavailable");
                return None;
            }
        };

        let Some(size) = position_size(
            balance,
            self.config.risk_per_trade,
            entry,
            stop_price,
            &meta,
            self.config.max_position_size,
        ) else {
            info!(balance = %balance, "Unsizeable entry: non-positive balance or risk per contract");
            return None;
        };

        debug!(
            direction = %direction,
            entry = %entry,
            stop = %stop_price,
            target = %target,
            size,
            source = ?stop_source,
            "Entry sized"
        );

        Some(ProtectedEntry {
            stop_price,
            target_price: target,
            size,
            stop_source,
        })
    }
}
