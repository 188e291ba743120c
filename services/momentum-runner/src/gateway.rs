//! Collaborator contracts
//!
//! The engine talks to market data, the order book, the broker and the
//! account only through these traits. Every call is expected to go through
//! [`guarded`] so a stalled collaborator cannot starve a loop.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::types::{
    Bar, BarEvent, BracketOrder, DepthSnapshot, Direction, IcebergLevel, IndicatorFrame,
    IndicatorSpec, TickMeta, Timeframe,
};

/// Bars, indicator frames and last price
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Up to `count` most recent closed bars, oldest first
    async fn bars(&self, timeframe: Timeframe, count: usize) -> GatewayResult<Vec<Bar>>;

    /// Up to `count` most recent bars augmented with the requested indicators
    async fn indicator_frame(
        &self,
        timeframe: Timeframe,
        count: usize,
        indicators: &[IndicatorSpec],
    ) -> GatewayResult<IndicatorFrame>;

    async fn current_price(&self) -> GatewayResult<Decimal>;
}

/// Depth and hidden-liquidity views of the live order book
#[async_trait]
pub trait OrderBookFeed: Send + Sync {
    /// Bid/ask volume ratio over the top `levels` levels
    async fn depth_imbalance(&self, levels: u32) -> GatewayResult<f64>;

    async fn detect_icebergs(&self) -> GatewayResult<Vec<IcebergLevel>>;

    async fn depth_snapshot(&self, levels: u32) -> GatewayResult<DepthSnapshot>;
}

/// Order placement and mutation
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit entry with attached stop and target; returns the position/order id
    async fn submit_bracket(&self, order: &BracketOrder) -> GatewayResult<String>;

    async fn modify_stop(&self, order_id: &str, new_stop: Decimal) -> GatewayResult<()>;

    /// Cancel the protective stop attached to `order_id`
    async fn cancel_stop(&self, order_id: &str) -> GatewayResult<()>;

    /// Place a standalone protective stop for `order_id`
    async fn place_stop(
        &self,
        order_id: &str,
        direction: Direction,
        size: u32,
        stop_price: Decimal,
    ) -> GatewayResult<()>;

    async fn close_position(&self, position_id: &str) -> GatewayResult<()>;
}

/// Account and instrument metadata
#[async_trait]
pub trait AccountFeed: Send + Sync {
    async fn balance(&self) -> GatewayResult<Decimal>;

    async fn tick_meta(&self) -> GatewayResult<TickMeta>;
}

/// Shared handles to every collaborator
#[derive(Clone)]
pub struct Collaborators {
    pub market: Arc<dyn MarketData>,
    pub book: Arc<dyn OrderBookFeed>,
    pub orders: Arc<dyn OrderGateway>,
    pub account: Arc<dyn AccountFeed>,
    pub call_timeout: Duration,
}

impl Collaborators {
    /// Use one object for all four roles
    pub fn from_single<T>(inner: Arc<T>, call_timeout: Duration) -> Self
    where
        T: MarketData + OrderBookFeed + OrderGateway + AccountFeed + 'static,
    {
        Self {
            market: inner.clone(),
            book: inner.clone(),
            orders: inner.clone(),
            account: inner,
            call_timeout,
        }
    }
}

/// Run a collaborator call with an upper time bound
pub async fn guarded<T, F>(call: &str, limit: Duration, fut: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            call: call.to_string(),
            after_ms: limit.as_millis() as u64,
        }),
    }
}

/// Poll the latest bar of each timeframe and emit an event when it advances
pub fn spawn_bar_watcher(
    market: Arc<dyn MarketData>,
    timeframes: Vec<Timeframe>,
    poll: Duration,
    call_timeout: Duration,
    shutdown: CancellationToken,
) -> mpsc::Receiver<BarEvent> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut last_seen: Vec<Option<chrono::DateTime<chrono::Utc>>> = vec![None; timeframes.len()];
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Bar watcher stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            for (idx, tf) in timeframes.iter().enumerate() {
                let bars = match guarded("bars", call_timeout, market.bars(*tf, 1)).await {
                    Ok(bars) => bars,
                    Err(e) => {
                        warn!(timeframe = %tf, error = %e, "Bar poll failed");
                        continue;
                    }
                };
                let Some(latest) = bars.into_iter().last() else {
                    continue;
                };
                if last_seen[idx].map_or(true, |seen| latest.timestamp > seen) {
                    last_seen[idx] = Some(latest.timestamp);
                    let event = BarEvent { timeframe: *tf, bar: latest };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    rx
}
