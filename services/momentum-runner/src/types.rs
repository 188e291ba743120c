//! Core types shared by the decision pipeline and the exit manager
//!
//! These types define the contract between the engine and its collaborators
//! (feature pipeline, order book, broker).

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bar timeframes the engine monitors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "15sec")]
    Sec15,
    #[serde(rename = "1min")]
    Min1,
    #[serde(rename = "5min")]
    Min5,
    #[serde(rename = "15min")]
    Min15,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Sec15 => "15sec",
            Timeframe::Min1 => "1min",
            Timeframe::Min5 => "5min",
            Timeframe::Min15 => "15min",
        }
    }

    pub fn to_seconds(&self) -> i64 {
        match self {
            Timeframe::Sec15 => 15,
            Timeframe::Min1 => 60,
            Timeframe::Min5 => 300,
            Timeframe::Min15 => 900,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One closed OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// New-bar notification from the bar watcher
#[derive(Debug, Clone)]
pub struct BarEvent {
    pub timeframe: Timeframe,
    pub bar: Bar,
}

/// Indicator request sent to the feature pipeline
///
/// The engine never computes indicator math itself; it only names the
/// columns it needs and their parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Ema { fast: u32, slow: u32 },
    Macd { fast: u32, slow: u32, signal: u32 },
    Wae { sensitivity: u32 },
    Rsi { period: u32 },
    Atr { period: u32 },
    Sar { af: f64, max_af: f64 },
    Fvg { min_gap_size: f64 },
    OrderBlock { min_volume_percentile: u32 },
}

/// Column names produced by the feature pipeline
pub mod columns {
    pub const EMA_FAST: &str = "ema_fast";
    pub const EMA_SLOW: &str = "ema_slow";
    pub const MACD_HIST: &str = "macd_hist";
    pub const WAE_EXPLOSION: &str = "wae_explosion";
    pub const WAE_TREND: &str = "wae_trend";
    pub const WAE_DEADZONE: &str = "wae_dead_zone";
    pub const RSI: &str = "rsi";
    pub const ATR: &str = "atr";
    pub const SAR: &str = "sar";
    pub const OB_BULLISH: &str = "ob_bullish";
    pub const OB_BEARISH: &str = "ob_bearish";
    pub const OB_TOP: &str = "ob_top";
    pub const OB_BOTTOM: &str = "ob_bottom";
    pub const FVG_BULLISH: &str = "fvg_bullish";
    pub const FVG_BEARISH: &str = "fvg_bearish";
    pub const FVG_GAP_TOP: &str = "fvg_gap_top";
    pub const FVG_GAP_BOTTOM: &str = "fvg_gap_bottom";
}

/// Bars augmented with named indicator columns
///
/// Columns are aligned with `bars` (same length, oldest first). A cell may be
/// null while an indicator warms up; flag columns encode true as non-zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorFrame {
    pub bars: Vec<Bar>,
    #[serde(default)]
    pub columns: HashMap<String, Vec<Option<f64>>>,
}

impl IndicatorFrame {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            bars,
            columns: HashMap::new(),
        }
    }

    pub fn with_column(mut self, name: &str, values: Vec<Option<f64>>) -> Self {
        self.columns.insert(name.to_string(), values);
        self
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// True when the frame holds at least `min_bars` bars
    pub fn has_window(&self, min_bars: usize) -> bool {
        self.bars.len() >= min_bars
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Value on the latest row, `None` if null or missing
    pub fn last(&self, name: &str) -> Option<f64> {
        self.columns.get(name)?.last().copied().flatten()
    }

    /// Last `n` values of a column, `None` if any is missing
    pub fn tail(&self, name: &str, n: usize) -> Option<Vec<f64>> {
        let col = self.columns.get(name)?;
        if col.len() < n {
            return None;
        }
        col[col.len() - n..].iter().copied().collect()
    }

    /// Flag column evaluated on the latest row
    pub fn flag(&self, name: &str) -> bool {
        self.last(name).map(|v| v != 0.0).unwrap_or(false)
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// Bar immediately preceding the latest one
    pub fn previous_bar(&self) -> Option<&Bar> {
        self.bars.len().checked_sub(2).and_then(|i| self.bars.get(i))
    }

    pub fn last_close_f64(&self) -> Option<f64> {
        self.last_bar().and_then(|b| b.close.to_f64())
    }
}

/// Qualitative trend of one timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendState {
    Bullish,
    Bearish,
    Neutral,
}

/// Aggregated trading permission for a decision cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeMode {
    LongOnly,
    ShortOnly,
    NoTrade,
}

impl TradeMode {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            TradeMode::LongOnly => Some(Direction::Long),
            TradeMode::ShortOnly => Some(Direction::Short),
            TradeMode::NoTrade => None,
        }
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookSide {
    Bid,
    Ask,
}

/// A price level where an iceberg order was detected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcebergLevel {
    pub side: BookSide,
    pub price: Decimal,
    pub size: Decimal,
}

/// One resting level in a depth snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

/// Top-of-book depth snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// Instrument tick metadata
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickMeta {
    pub tick_size: Decimal,
    pub tick_value: Decimal,
}

impl TickMeta {
    pub fn is_valid(&self) -> bool {
        self.tick_size > Decimal::ZERO && self.tick_value > Decimal::ZERO
    }
}

/// Bracket order request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketOrder {
    pub client_order_id: uuid::Uuid,
    pub direction: Direction,
    pub size: u32,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub target_price: Decimal,
}
