//! Order-flow confirmation
//!
//! Fails closed: without depth-imbalance data no entry is confirmed.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::OrderFlowConfig;
use crate::gateway::{guarded, OrderBookFeed};
use crate::types::{BookSide, DepthSnapshot, Direction, IcebergLevel};

/// Result of one order-flow check
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderBookConfirmation {
    pub imbalance: Option<f64>,
    pub icebergs: Vec<IcebergLevel>,
    pub confirmed: bool,
    pub reason: String,
}

/// Bid/ask share of resting volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BookPressure {
    pub bid_pressure: f64,
    pub ask_pressure: f64,
    pub net_pressure: f64,
    pub bid_volume: Decimal,
    pub ask_volume: Decimal,
}

/// Side whose icebergs block an entry in `direction`
fn opposing_side(direction: Direction) -> BookSide {
    match direction {
        Direction::Long => BookSide::Ask,
        Direction::Short => BookSide::Bid,
    }
}

/// Imbalance gate for `direction`; `Some(reason)` when it fails
pub fn imbalance_rejection(config: &OrderFlowConfig, direction: Direction, imbalance: f64) -> Option<String> {
    match direction {
        Direction::Long if imbalance < config.imbalance_long => Some(format!(
            "Insufficient bid imbalance: {:.2} < {}",
            imbalance, config.imbalance_long
        )),
        Direction::Short if imbalance > config.imbalance_short => Some(format!(
            "Insufficient ask imbalance: {:.2} > {}",
            imbalance, config.imbalance_short
        )),
        _ => None,
    }
}

/// Iceberg gate for `direction`; only icebergs against the trade block it
pub fn iceberg_rejection(direction: Direction, icebergs: &[IcebergLevel]) -> Option<String> {
    let side = opposing_side(direction);
    let blocking = icebergs.iter().filter(|i| i.side == side).count();
    (blocking > 0).then(|| {
        let label = match side {
            BookSide::Ask => "ask",
            BookSide::Bid => "bid",
        };
        format!("Detected {blocking} iceberg orders on {label} side")
    })
}

/// Share of bid vs ask volume in a snapshot
pub fn pressure_of(snapshot: &DepthSnapshot) -> BookPressure {
    let bid_volume: Decimal = snapshot.bids.iter().map(|l| l.volume).sum();
    let ask_volume: Decimal = snapshot.asks.iter().map(|l| l.volume).sum();
    let total = bid_volume + ask_volume;
    if total <= Decimal::ZERO {
        return BookPressure::default();
    }

    let bid_pressure = (bid_volume / total).to_f64().unwrap_or(0.0);
    let ask_pressure = (ask_volume / total).to_f64().unwrap_or(0.0);
    BookPressure {
        bid_pressure,
        ask_pressure,
        net_pressure: bid_pressure - ask_pressure,
        bid_volume,
        ask_volume,
    }
}

pub struct OrderFlowConfirmer {
    book: Arc<dyn OrderBookFeed>,
    config: OrderFlowConfig,
    call_timeout: Duration,
}

impl OrderFlowConfirmer {
    pub fn new(book: Arc<dyn OrderBookFeed>, config: OrderFlowConfig, call_timeout: Duration) -> Self {
        Self {
            book,
            config,
            call_timeout,
        }
    }

    async fn imbalance(&self) -> Option<f64> {
        let call = self.book.depth_imbalance(self.config.depth_levels);
        match guarded("depth_imbalance", self.call_timeout, call).await {
            Ok(v) if v.is_finite() => Some(v),
            Ok(v) => {
                warn!(imbalance = v, "Non-finite depth imbalance ignored");
                None
            }
            Err(e) => {
                debug!(error = %e, "Depth imbalance unavailable");
                None
            }
        }
    }

    /// Detected icebergs; collaborator failure reads as none detected
    async fn icebergs(&self) -> Vec<IcebergLevel> {
        match guarded("detect_icebergs", self.call_timeout, self.book.detect_icebergs()).await {
            Ok(levels) => levels,
            Err(e) => {
                debug!(error = %e, "Iceberg detection unavailable");
                Vec::new()
            }
        }
    }

    /// Validate an entry in `direction` against live depth
    pub async fn confirm_entry(&self, direction: Direction) -> (bool, OrderBookConfirmation) {
        let mut confirmation = OrderBookConfirmation::default();

        let Some(imbalance) = self.imbalance().await else {
            confirmation.reason = "OrderBook data unavailable".to_string();
            info!(direction = %direction, reason = %confirmation.reason, "Order flow rejected");
            return (false, confirmation);
        };
        confirmation.imbalance = Some(imbalance);

        if let Some(reason) = imbalance_rejection(&self.config, direction, imbalance) {
            confirmation.reason = reason;
            info!(direction = %direction, reason = %confirmation.reason, "Order flow rejected");
            return (false, confirmation);
        }

        if self.config.iceberg_check {
            confirmation.icebergs = self.icebergs().await;
            if let Some(reason) = iceberg_rejection(direction, &confirmation.icebergs) {
                confirmation.reason = reason;
                info!(direction = %direction, reason = %confirmation.reason, "Order flow rejected");
                return (false, confirmation);
            }
        }

        let pressure = self.pressure().await;
        confirmation.confirmed = true;
        confirmation.reason = match direction {
            Direction::Long => format!("Long entry confirmed with imbalance {imbalance:.2}"),
            Direction::Short => format!("Short entry confirmed with imbalance {imbalance:.2}"),
        };
        info!(
            direction = %direction,
            imbalance,
            net_pressure = pressure.net_pressure,
            "Order flow confirmed"
        );
        (true, confirmation)
    }

    /// Depth pressure snapshot; zeros when the book is unavailable
    pub async fn pressure(&self) -> BookPressure {
        let call = self.book.depth_snapshot(self.config.depth_levels);
        match guarded("depth_snapshot", self.call_timeout, call).await {
            Ok(snapshot) => pressure_of(&snapshot),
            Err(e) => {
                debug!(error = %e, "Depth snapshot unavailable");
                BookPressure::default()
            }
        }
    }
}
